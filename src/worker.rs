//! Off-loop execution of CPU-bound work.
//!
//! The core is single-threaded; the worker facility runs one closure
//! on a plain thread and hands the result back through a oneshot
//! channel, to be awaited from the event loop. The worker never
//! touches core state. Dropping the handle cancels the operation:
//! the result is released and the thread detaches.
use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Handle onto one off-loop computation.
///
/// Await it on the loop to obtain the result.
#[derive(Debug)]
pub struct WorkerHandle<T> {
    receiver: oneshot::Receiver<T>,
}

/// Runs `work` on a worker thread and returns the handle to await.
pub fn spawn<T, F>(work: F) -> WorkerHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    std::thread::Builder::new()
        .name("vellum-worker".to_string())
        .spawn(move || {
            // A dropped handle cancelled the operation; the result is
            // simply released.
            let _ = sender.send(work());
        })
        .expect("worker thread could not be spawned");
    WorkerHandle { receiver }
}

impl<T> Future for WorkerHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<T> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                // The worker died without delivering; awaiting a
                // result that can no longer arrive is a programming
                // error.
                panic!("worker thread dropped its result before delivering");
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
