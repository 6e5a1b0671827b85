use crate::algorithm::{Algorithm, AlgorithmConfig};
use crate::chunk::TextChunk;
use crate::error::OtError;
use crate::id::{uid, UserId};
use crate::op::Operation;
use crate::request::Request;
use crate::vector::StateVector;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Action {
    Insert { at: u16, text: String },
    Delete { at: u16, len: u16 },
    Undo,
    Redo,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => (any::<u16>(), "[a-z]{1,4}").prop_map(|(at, text)| Action::Insert { at, text }),
        3 => (any::<u16>(), 1u16..5).prop_map(|(at, len)| Action::Delete { at, len }),
        1 => Just(Action::Undo),
        1 => Just(Action::Redo),
    ]
}

fn site(seed: &Request) -> Algorithm {
    let mut site = Algorithm::new(TextChunk::new("UTF-8"), AlgorithmConfig::default());
    site.add_user(uid(1), StateVector::new());
    site.add_user(uid(2), StateVector::new());
    site.execute(seed.clone()).expect("seed applies cleanly");
    site
}

/// Runs a local action, clamping offsets into the current buffer, and
/// returns the wire request if one was produced.
fn run(site: &mut Algorithm, user: UserId, action: &Action) -> Option<Request> {
    let len = site.buffer().len();
    let result = match action {
        Action::Insert { at, text } => {
            let pos = u32::from(*at) % (len + 1);
            site.generate_do(
                user,
                Operation::Insert {
                    pos,
                    chunk: TextChunk::from_text("UTF-8", text, user),
                },
            )
        }
        Action::Delete { at, len: del } => {
            if len == 0 {
                return None;
            }
            let pos = u32::from(*at) % len;
            let del = u32::from(*del).min(len - pos);
            site.generate_do(user, Operation::DeleteStripped { pos, len: del })
        }
        Action::Undo => site.generate_undo(user),
        Action::Redo => site.generate_redo(user),
    };
    match result {
        Ok(wire) => Some(wire),
        Err(OtError::UndoUnavailable { .. }) => None,
        Err(err) => panic!("local action failed: {}", err),
    }
}

proptest! {
    /// Two sites edit independently from a common seed and then
    /// exchange their requests; both must end up with the same buffer
    /// and the same state vector.
    #[test]
    fn two_sites_converge(
        actions_a in prop::collection::vec(arb_action(), 0..10),
        actions_b in prop::collection::vec(arb_action(), 0..10),
    ) {
        let mut seeder = Algorithm::new(TextChunk::new("UTF-8"), AlgorithmConfig::default());
        seeder.add_user(uid(1), StateVector::new());
        seeder.add_user(uid(2), StateVector::new());
        let seed = seeder
            .generate_do(
                uid(1),
                Operation::Insert {
                    pos: 0,
                    chunk: TextChunk::from_text("UTF-8", "shared document", uid(1)),
                },
            )
            .unwrap();

        let mut a = site(&seed);
        let mut b = site(&seed);

        let mut from_a = Vec::new();
        for action in &actions_a {
            from_a.extend(run(&mut a, uid(1), action));
        }
        let mut from_b = Vec::new();
        for action in &actions_b {
            from_b.extend(run(&mut b, uid(2), action));
        }

        for request in from_b {
            a.execute(request).expect("remote request from b applies");
        }
        for request in from_a {
            b.execute(request).expect("remote request from a applies");
        }

        prop_assert_eq!(a.buffer().text(), b.buffer().text());
        prop_assert_eq!(a.current(), b.current());
    }
}
