use axum::{response::IntoResponse, Json};
use serde_json::json;

use crate::error::{Error, Result};
use crate::store::{CommitGate, Store};
use crate::AppState;

pub mod admin;
pub mod client;
pub mod gateway;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Run a store call on the blocking pool, bounded by the configured store
/// timeout. A call that has not started committing when the timeout fires is
/// abandoned and its transaction aborted (`TransientStore`); one that already
/// started committing is awaited so its result is never lost.
pub async fn blocking<T, F>(state: &AppState, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Store) -> Result<T> + Send + 'static,
{
    let gate = CommitGate::new();
    let store = state.store.gated(gate.clone());
    let timeout = state.settings.store_timeout;
    let mut task = tokio::task::spawn_blocking(move || f(store));
    let joined = match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => joined,
        Err(_) if gate.cancel() => {
            return Err(Error::TransientStore(format!(
                "store call exceeded {}",
                humantime::format_duration(timeout)
            )));
        }
        Err(_) => task.await,
    };
    joined.map_err(|e| Error::Internal(format!("store task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::keys::generate_keypair;
    use crate::store::{Actor, NewGateway, NewPeer, Placement, Protocol, Registration};
    use crate::{open_state, Settings};

    fn new_peer() -> NewPeer {
        NewPeer {
            id: "peer-1".into(),
            name: "laptop".into(),
            email: None,
            device_name: None,
            device_type: None,
            notes: None,
            public_key: generate_keypair().unwrap().public_key,
            allowed_ips: vec!["0.0.0.0/0".into()],
            dns_servers: vec!["1.1.1.1".into()],
            persistent_keepalive: 25,
            mtu: 1420,
            expires_at: None,
            token_hash: "client-1".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_write_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            store_timeout: Duration::from_millis(200),
            ..Settings::default()
        };
        let state = open_state(dir.path(), Some("admin".into()), settings).unwrap();
        let gw = state
            .store
            .create_gateway(
                NewGateway {
                    hostname: "gw-slow".into(),
                    region: "europe".into(),
                    country_code: "DE".into(),
                    city: None,
                    protocol: Protocol::WireGuard,
                    listen_port: 51820,
                    max_peers: None,
                    pool_cidr: "10.40.0.0/24".into(),
                },
                "prov",
                &Actor::Admin,
            )
            .unwrap();
        state
            .store
            .register_gateway(
                "prov",
                "gw-token",
                Registration {
                    public_key: generate_keypair().unwrap().public_key,
                    public_ip: "198.51.100.8".into(),
                    listen_port: None,
                    obfuscation: None,
                },
            )
            .unwrap();

        // Another writer holds the lock well past the timeout.
        let (held_tx, held_rx) = mpsc::channel();
        let holder = state.store.clone();
        let writer = std::thread::spawn(move || {
            let txn = holder.db.begin_write().unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(800));
            drop(txn);
        });
        held_rx.recv().unwrap();

        let placement = Placement::Gateway(gw.id.clone());
        let res = blocking(&state, move |store| {
            store.create_peer(&placement, new_peer(), &Actor::Admin, 3)
        })
        .await;
        assert!(matches!(res, Err(Error::TransientStore(_))));

        writer.join().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(state.store.sync_record(&gw.id).unwrap().generation, 0);
        assert!(state.store.gateway_peers(&gw.id, 0).unwrap().1.is_empty());
    }

    #[tokio::test]
    async fn fast_calls_return_their_result() {
        let dir = tempfile::tempdir().unwrap();
        let state = open_state(dir.path(), None, Settings::default()).unwrap();
        let version = blocking(&state, |store| store.current_schema_version())
            .await
            .unwrap();
        assert_eq!(version, crate::store::db::schema_version());
    }
}
