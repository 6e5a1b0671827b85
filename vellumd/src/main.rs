use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vellum::{
    AccountId, ConnectionId, FileStorage, MemoryStorage, Server, ServerConfig, SessionConfig,
    Storage,
};

const DEFAULT_PORT: u16 = 6523;
const DEFAULT_AUTOSAVE_INTERVAL: u64 = 60;

/// Collaborative text editing server.
#[derive(Debug, Parser)]
#[command(name = "vellumd", version, about)]
struct Args {
    /// Configuration file to load; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on (default 6523).
    #[arg(long)]
    port: Option<u16>,

    /// Root directory for persisted documents. Without it, documents
    /// live in memory for the process lifetime.
    #[arg(long)]
    root_directory: Option<PathBuf>,

    /// Document types to serve (default "text").
    #[arg(long, value_delimiter = ',')]
    plugins: Option<Vec<String>>,

    /// Seconds between autosave passes (default 60); 0 disables
    /// autosave.
    #[arg(long)]
    autosave_interval: Option<u64>,

    /// Per-request translation distance limit; 0 (the default)
    /// disables the protection.
    #[arg(long)]
    max_translation_vdiff: Option<u64>,
}

/// Values read from the configuration file. Everything is optional;
/// flags override, built-in defaults fill the rest.
#[derive(Debug, Default)]
struct FileConfig {
    port: Option<u16>,
    root_directory: Option<PathBuf>,
    plugins: Option<Vec<String>>,
    autosave_interval: Option<u64>,
    max_translation_vdiff: Option<u64>,
}

/// Parses a line-oriented `key = value` configuration file. The keys
/// are the flag names; unknown keys fail startup rather than being
/// silently ignored.
fn parse_config_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration file {}", path.display()))?;
    let mut config = FileConfig::default();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!("{}:{}: expected `key = value`", path.display(), number + 1);
        };
        let (key, value) = (key.trim(), value.trim());
        let place = || format!("{}:{}: invalid value for {}", path.display(), number + 1, key);
        match key {
            "port" => config.port = Some(value.parse().with_context(place)?),
            "root-directory" => config.root_directory = Some(PathBuf::from(value)),
            "plugins" => {
                config.plugins = Some(
                    value
                        .split(',')
                        .map(|plugin| plugin.trim().to_string())
                        .filter(|plugin| !plugin.is_empty())
                        .collect(),
                )
            }
            "autosave-interval" => {
                config.autosave_interval = Some(value.parse().with_context(place)?)
            }
            "max-translation-vdiff" => {
                config.max_translation_vdiff = Some(value.parse().with_context(place)?)
            }
            other => bail!("{}:{}: unknown key {:?}", path.display(), number + 1, other),
        }
    }
    Ok(config)
}

/// The fully resolved settings: flag, else config file, else default.
#[derive(Debug)]
struct Settings {
    port: u16,
    root_directory: Option<PathBuf>,
    server: ServerConfig,
}

fn resolve(args: &Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => parse_config_file(path)?,
        None => FileConfig::default(),
    };
    let port = args.port.or(file.port).unwrap_or(DEFAULT_PORT);
    let root_directory = args.root_directory.clone().or(file.root_directory);
    let plugins = args
        .plugins
        .clone()
        .or(file.plugins)
        .unwrap_or_else(|| vec!["text".to_string()]);
    let autosave_interval = args
        .autosave_interval
        .or(file.autosave_interval)
        .unwrap_or(DEFAULT_AUTOSAVE_INTERVAL);
    let max_translation_vdiff = args
        .max_translation_vdiff
        .or(file.max_translation_vdiff)
        .unwrap_or(0);

    let mut server = ServerConfig::default();
    server.directory.plugins = plugins;
    server.directory.session = SessionConfig {
        max_translation_vdiff: (max_translation_vdiff > 0).then_some(max_translation_vdiff),
        ..SessionConfig::default()
    };
    server.autosave_interval =
        (autosave_interval > 0).then(|| Duration::from_secs(autosave_interval));
    Ok(Settings {
        port,
        root_directory,
        server,
    })
}

fn init_tracing() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

fn main() {
    init_tracing();
    let args = Args::parse();
    let settings = match resolve(&args) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!("startup failed: {:#}", err);
            std::process::exit(1);
        }
    };
    let storage: Box<dyn Storage> = match &settings.root_directory {
        Some(root) => match FileStorage::new(root) {
            Ok(storage) => {
                tracing::info!("persisting documents under {}", root.display());
                Box::new(storage)
            }
            Err(err) => {
                tracing::error!("startup failed: {}", err);
                std::process::exit(1);
            }
        },
        None => {
            tracing::info!("no root directory given; documents live in memory");
            Box::new(MemoryStorage::new())
        }
    };
    if let Err(err) = serve(settings.server, storage, settings.port) {
        tracing::error!("fatal: {:#}", err);
        std::process::exit(2);
    }
}

/// Accepts plain TCP connections and shuttles bytes between the
/// sockets and the core, all on one cooperative loop. A TLS-capable
/// transport wraps the streams the same way.
fn serve(config: ServerConfig, storage: Box<dyn Storage>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("cannot listen on port {}", port))?;
    listener.set_nonblocking(true)?;
    let mut server: Server<Box<dyn Storage>> = Server::new(Some(storage), config);
    let keepalive = server.keepalive();
    tracing::info!(
        "vellumd listening on port {} (keepalive: enabled={} time={:?} interval={:?})",
        port,
        keepalive.enabled,
        keepalive.time,
        keepalive.interval
    );

    let mut streams: HashMap<ConnectionId, TcpStream> = HashMap::new();
    let mut next_connection = 1u64;
    let mut buffer = [0u8; 4096];
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                let id = ConnectionId(next_connection);
                next_connection += 1;
                tracing::info!("connection {} accepted from {}", id, peer);
                // Connections authenticate out of band; without that,
                // they act as the default account.
                server.connection_opened(id, AccountId::default_account());
                streams.insert(id, stream);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err).context("accept failed"),
        }

        let mut closed = Vec::new();
        for (id, stream) in streams.iter_mut() {
            match stream.read(&mut buffer) {
                Ok(0) => closed.push(*id),
                Ok(read) => {
                    if server.connection_data(*id, &buffer[..read]).is_err() {
                        closed.push(*id);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::warn!("read from connection {} failed: {}", id, err);
                    closed.push(*id);
                }
            }
        }
        for (to, bytes) in server.take_outgoing() {
            if let Some(stream) = streams.get_mut(&to) {
                if let Err(err) = stream.write_all(&bytes) {
                    tracing::warn!("write to connection {} failed: {}", to, err);
                    closed.push(to);
                }
            }
        }
        for id in closed {
            streams.remove(&id);
            server.connection_closed(id);
        }

        server.tick(Instant::now());
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(contents: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "vellumd-config-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn args(config: Option<PathBuf>) -> Args {
        Args {
            config,
            port: None,
            root_directory: None,
            plugins: None,
            autosave_interval: None,
            max_translation_vdiff: None,
        }
    }

    #[test]
    fn config_file_values_are_applied() {
        let path = scratch_file(
            "# server settings\n\
             port = 7000\n\
             plugins = text, markdown\n\
             autosave-interval = 30\n\
             max-translation-vdiff = 512\n\
             root-directory = /var/lib/vellum\n",
        );
        let settings = resolve(&args(Some(path.clone()))).unwrap();
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.server.directory.plugins, vec!["text", "markdown"]);
        assert_eq!(
            settings.server.autosave_interval,
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            settings.server.directory.session.max_translation_vdiff,
            Some(512)
        );
        assert_eq!(
            settings.root_directory.as_deref(),
            Some(Path::new("/var/lib/vellum"))
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn flags_override_the_config_file() {
        let path = scratch_file("port = 7000\nautosave-interval = 30\n");
        let mut args = args(Some(path.clone()));
        args.port = Some(9000);
        args.autosave_interval = Some(0);
        let settings = resolve(&args).unwrap();
        assert_eq!(settings.port, 9000);
        // 0 disables autosave even though the file sets an interval.
        assert_eq!(settings.server.autosave_interval, None);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let settings = resolve(&args(None)).unwrap();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.root_directory, None);
        assert_eq!(settings.server.directory.plugins, vec!["text"]);
        assert_eq!(
            settings.server.autosave_interval,
            Some(Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL))
        );
        assert_eq!(
            settings.server.directory.session.max_translation_vdiff,
            None
        );
    }

    #[test]
    fn malformed_and_unknown_keys_fail_startup() {
        let path = scratch_file("port 7000\n");
        assert!(resolve(&args(Some(path.clone()))).is_err());
        std::fs::remove_file(&path).ok();
        let path = scratch_file("listen-port = 7000\n");
        assert!(resolve(&args(Some(path.clone()))).is_err());
        std::fs::remove_file(&path).ok();
        let path = scratch_file("port = seven\n");
        assert!(resolve(&args(Some(path.clone()))).is_err());
        std::fs::remove_file(&path).ok();
    }
}
