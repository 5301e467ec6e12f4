//! RaftGuru watcher: follows the current batch and logs its grid.
//!
//! Logs in (credentials from `RAFTGURU_EMAIL` / `RAFTGURU_PASSWORD`, or an
//! existing session cookie), connects, watches the current batch and keeps
//! reconnecting until interrupted.

use std::sync::Arc;

use log::{error, info, warn};

use raftguru_sync::{
    FileTokenStore, HttpRecordApi, HttpSession, MemoryTokenStore, MirrorStore, RecordApi, Slot,
    SyncConfig, SyncEngine, SyncError, SyncEvent, TileRef, TokenStore,
};

/// One line per grid row: `A | T1 (2) | ·      | T3 (0)`.
fn render_grid(mirror: &MirrorStore) -> String {
    let mut out = String::new();
    match mirror.batch() {
        Some(batch) => out.push_str(&format!("batch {}\n", batch.id)),
        None => out.push_str("no current batch\n"),
    }
    for row in TileRef::ALL.chunks(3) {
        let label = &row[0].as_str()[..1];
        out.push_str(label);
        for slot in row {
            let cell = match mirror.slot(*slot) {
                Slot::Empty => "·".to_string(),
                Slot::Occupied(entry) => {
                    let flag = if entry.tile.standup { "*" } else { "" };
                    format!("{}{flag} ({})", entry.tile.id, entry.rafts.len())
                }
            };
            out.push_str(&format!(" | {cell:<12}"));
        }
        out.push('\n');
    }
    out
}

async fn log_events(engine: Arc<SyncEngine>) {
    let mut events = engine.events();
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Connected => info!("connected"),
            SyncEvent::Disconnected => warn!("disconnected"),
            SyncEvent::BatchClosed(id) => info!("batch {id} closed"),
            _ => {
                // Let a burst of events settle into one redraw.
                while events.try_recv().is_ok() {}
                info!("\n{}", render_grid(&engine.snapshot().await));
            }
        }
    }
}

async fn run(config: SyncConfig) -> Result<(), SyncError> {
    let api: Arc<dyn RecordApi> = Arc::new(HttpRecordApi::new(config.api_url.clone())?);
    let session = HttpSession::new(api);
    match (
        std::env::var("RAFTGURU_EMAIL"),
        std::env::var("RAFTGURU_PASSWORD"),
    ) {
        (Ok(email), Ok(password)) => {
            session.login(&email, &password).await?;
        }
        _ => {
            if session.auto_login().await.is_none() {
                return Err(SyncError::NotLoggedIn);
            }
        }
    }

    let tokens: Arc<dyn TokenStore> = match &config.token_path {
        Some(path) => Arc::new(FileTokenStore::new(path.clone())),
        None => Arc::new(MemoryTokenStore::new()),
    };
    let engine = Arc::new(SyncEngine::new(config.clone(), tokens));
    match engine.last_batch_hint() {
        Ok(Some(hint)) => info!("last active batch was {hint}"),
        Ok(None) => {}
        Err(e) => warn!("{e}"),
    }
    tokio::spawn(log_events(engine.clone()));

    let mut failures = 0u32;
    loop {
        match engine.bootstrap(&session).await {
            Ok(uid) => {
                failures = 0;
                let pump = tokio::spawn({
                    let engine = engine.clone();
                    async move { engine.run().await }
                });
                match engine.first_event(&uid).await {
                    Ok(()) => info!("watching {uid}"),
                    Err(e) => warn!("no initial state for {uid}: {e}"),
                }
                match pump.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("event loop stopped: {e}"),
                    Err(e) => error!("event loop panicked: {e}"),
                }
            }
            Err(SyncError::NotLoggedIn) => return Err(SyncError::NotLoggedIn),
            Err(e) => {
                failures += 1;
                warn!("connect attempt {failures} failed: {e}");
                if config
                    .max_reconnect_attempts
                    .is_some_and(|max| failures >= max)
                {
                    return Err(e);
                }
            }
        }
        info!("reconnecting in {:?}", config.reconnect_delay);
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting RaftGuru watcher...");
    let config = SyncConfig::from_env();
    info!("server: {} / {}", config.ws_url, config.api_url);

    tokio::select! {
        result = run(config) => {
            if let Err(e) = result {
                error!("{e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftguru_sync::{Batch, Tile};

    #[test]
    fn test_render_empty_grid() {
        let text = render_grid(&MirrorStore::new());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "no current batch");
        assert_eq!(lines.len(), 5);
        assert!(lines[1].starts_with('A'));
        assert_eq!(lines[1].matches('·').count(), 3);
    }

    #[test]
    fn test_render_occupied_slot() {
        let mut mirror = MirrorStore::new();
        mirror.set_batch(Batch {
            id: "B1".into(),
            date_created: None,
            is_current: true,
            tiles: Vec::new(),
        });
        mirror.insert_tile(Tile {
            id: "T1".into(),
            slot: TileRef::B1,
            standup: true,
            batch: Some("B1".into()),
            rafts: Vec::new(),
            user_created: None,
            user_updated: None,
        });

        let text = render_grid(&mirror);
        assert!(text.starts_with("batch B1"));
        assert!(text.lines().nth(2).unwrap().contains("T1* (0)"));
    }
}
