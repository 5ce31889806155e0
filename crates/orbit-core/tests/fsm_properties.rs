use chrono::Utc;
use orbit_core::{generate_deployment_id, ClusterState, Command, User};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    New { id: u8, username: u8, email: u8 },
    Remove { id: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // Small pools so that collisions are frequent.
    prop_oneof![
        3 => (0u8..6, 0u8..4, 0u8..4)
            .prop_map(|(id, username, email)| Op::New { id, username, email }),
        1 => (0u8..6).prop_map(|id| Op::Remove { id }),
    ]
}

fn to_command(op: &Op) -> Command {
    match op {
        Op::New { id, username, email } => Command::UserNew(User {
            id: format!("user-{}", id),
            name: format!("Name {}", username),
            username: format!("user{}", username),
            email: format!("user{}@example.com", email),
            password_hash: String::new(),
            created_at: Utc::now(),
        }),
        Op::Remove { id } => Command::UserRemove {
            id: format!("user-{}", id),
        },
    }
}

proptest! {
    #[test]
    fn usernames_and_emails_stay_unique(ops in prop::collection::vec(op_strategy(), 0..64)) {
        let mut state = ClusterState::new();

        for op in &ops {
            // Rejections are expected; they must leave the state consistent.
            let _ = state.apply(&to_command(op));

            let usernames: HashSet<_> = state.users.values().map(|u| &u.username).collect();
            let emails: HashSet<_> = state.users.values().map(|u| &u.email).collect();
            prop_assert_eq!(usernames.len(), state.users.len());
            prop_assert_eq!(emails.len(), state.users.len());
        }
    }

    #[test]
    fn replicas_converge_on_same_command_sequence(
        ops in prop::collection::vec(op_strategy(), 0..64)
    ) {
        let commands: Vec<Command> = ops.iter().map(to_command).collect();
        let mut a = ClusterState::new();
        let mut b = ClusterState::new();

        for cmd in &commands {
            let ra = a.apply(cmd);
            let rb = b.apply(cmd);
            prop_assert_eq!(ra.is_ok(), rb.is_ok());
        }
        prop_assert_eq!(a, b);
    }

    #[test]
    fn generated_deployment_id_is_fresh(existing in prop::collection::vec("[0-9a-f]{16}", 0..32)) {
        let id = generate_deployment_id(&existing);
        prop_assert!(!existing.contains(&id));
        prop_assert_eq!(id.len(), 16);
    }
}

#[test]
fn second_signup_with_same_username_is_rejected() {
    let mut state = ClusterState::new();

    let first = state
        .generate_user(orbit_core::UserConfig {
            name: "A".into(),
            username: "a".into(),
            email: "a@x.com".into(),
            password: "secret".into(),
        })
        .unwrap();
    state.apply(&Command::UserNew(first)).unwrap();

    let second = state.generate_user(orbit_core::UserConfig {
        name: "A2".into(),
        username: "a".into(),
        email: "b@x.com".into(),
        password: "secret".into(),
    });

    assert!(matches!(second, Err(orbit_core::StateError::UsernameTaken(_))));
    assert_eq!(state.users.len(), 1);
}
