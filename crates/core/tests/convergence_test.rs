//! Randomized schedules: jitter, loss and staggered joins
//!
//! Every schedule is derived from a seed, so a failure names the seed that
//! reproduces it.

mod harness;

use harness::{MeshHarness, ROOM};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use voicemesh_core::peer::Role;
use voicemesh_core::testing::LinkConditions;
use voicemesh_core::{PeerId, SessionEvent, SessionState};

const PEERS: [&str; 4] = ["ana", "ben", "cy", "dee"];

#[tokio::test(start_paused = true)]
async fn test_simultaneous_initiation_resolves_to_smaller_identity() {
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let conditions = LinkConditions {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
            drop_rate: 0.0,
        };
        let mut mesh = MeshHarness::new(seed, conditions);
        mesh.add("ana");
        mesh.add("ben");

        let ana = mesh.get("ana");
        let ben = mesh.get("ben");
        ana.manager.start_capture(None).await.unwrap();
        ben.manager.start_capture(None).await.unwrap();

        // Stagger stays below the minimum link delay so both offers are
        // outstanding when the first one lands
        let stagger = Duration::from_millis(rng.gen_range(0..40));
        let (first, second) = if rng.gen_bool(0.5) { (ana, ben) } else { (ben, ana) };
        first.manager.initiate(second.id.clone()).await.unwrap();
        tokio::time::sleep(stagger).await;
        second.manager.initiate(first.id.clone()).await.unwrap();

        mesh.settle(Duration::from_secs(3)).await;
        mesh.assert_full_mesh().await;

        let ana_status = ana.manager.status().await;
        let ben_status = ben.manager.status().await;
        assert_eq!(ana_status.sessions[0].role, Some(Role::Initiator), "seed {}", seed);
        assert_eq!(ben_status.sessions[0].role, Some(Role::Responder), "seed {}", seed);
        assert_eq!(ana.count(&SessionEvent::PeerConnected(ben.id.clone())), 1);
        assert_eq!(ben.count(&SessionEvent::PeerConnected(ana.id.clone())), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_staggered_joins_converge_to_full_mesh() {
    for seed in 0..10u64 {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let mut mesh = MeshHarness::new(seed, LinkConditions::jittery(Duration::from_millis(400)));
        for id in PEERS {
            mesh.add(id);
        }

        let mut order = PEERS.to_vec();
        order.shuffle(&mut rng);
        for id in order {
            let participant = mesh.get(id);
            participant.manager.start_capture(None).await.unwrap();
            participant.join(ROOM).await;
            tokio::time::sleep(Duration::from_millis(rng.gen_range(0..500))).await;
        }

        mesh.settle(Duration::from_secs(10)).await;
        mesh.assert_full_mesh().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_lossy_links_settle_in_agreement() {
    for seed in 0..12u64 {
        let mut mesh = MeshHarness::new(
            seed,
            LinkConditions::lossy(Duration::from_millis(250), 0.05),
        );
        for id in PEERS {
            mesh.add(id);
        }
        mesh.join_all(&PEERS).await;

        // Long enough for every retry budget to run out
        mesh.settle(Duration::from_secs(600)).await;

        for a in PEERS {
            for b in PEERS {
                if a == b {
                    continue;
                }
                let (a_id, b_id) = (PeerId::from(a), PeerId::from(b));
                let forward = mesh.get(a).state_with(&b_id).await;
                let backward = mesh.get(b).state_with(&a_id).await;

                assert!(
                    matches!(forward, None | Some(SessionState::Connected)),
                    "seed {}: {} -> {} stuck in {:?}",
                    seed,
                    a,
                    b,
                    forward
                );
                assert_eq!(
                    forward == Some(SessionState::Connected),
                    backward == Some(SessionState::Connected),
                    "seed {}: {} and {} disagree",
                    seed,
                    a,
                    b
                );
            }
        }

        for participant in mesh.participants() {
            assert!(participant.manager.session_count() < PEERS.len());
        }
    }
}
