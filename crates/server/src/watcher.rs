//! Directory Watcher — discovers session transcript files under the
//! configured root and spawns a [`crate::tailer::Tailer`] task for each
//! one, forwarding their events into the shared pipeline.
//!
//! A `notify::RecommendedWatcher` recursively watches the root, forwarding
//! raw filesystem events through an unbounded channel into a single-task
//! event loop, backed by a periodic catch-up sweep that re-stats every
//! known file in case an fs event was dropped. `RELAY_POLL_WATCHER=1`
//! disables the `notify` backend entirely and relies only on the sweep,
//! for filesystems where inotify/FSEvents isn't available (network
//! mounts, some containers).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use relay_protocol::{ActivityState, DescriptorStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::SubscriptionBroker;
use crate::classifier::Classifier;
use crate::registry::SessionRegistry;
use crate::tailer::{self, TailEvent, Tailer};

const CATCHUP_SWEEP: Duration = Duration::from_secs(3);
const DEBOUNCE: Duration = Duration::from_millis(150);

enum WatcherMessage {
    FsEvent(PathBuf),
    Settled(PathBuf),
    Sweep,
}

struct TailerHandle {
    task: JoinHandle<()>,
    wake_tx: mpsc::Sender<()>,
}

/// Everything the watcher needs to wire a discovered file's events into the
/// rest of the system. Bundled so `main.rs` only has to build it once.
pub struct Pipeline {
    pub registry: std::sync::Arc<SessionRegistry>,
    pub classifier: std::sync::Arc<Classifier>,
    pub broker: std::sync::Arc<SubscriptionBroker>,
}

pub async fn run(root: PathBuf, poll_only: bool, pipeline: Pipeline) -> anyhow::Result<()> {
    std::fs::create_dir_all(&root)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<WatcherMessage>();

    let mut _watcher: Option<RecommendedWatcher> = None;
    if !poll_only {
        let watcher_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                    ) {
                        for path in event.paths {
                            let _ = watcher_tx.send(WatcherMessage::FsEvent(path));
                        }
                    }
                }
                Err(err) => warn!(component = "watcher", event = "watcher.fs_error", error = %err),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        _watcher = Some(watcher);
    }

    info!(
        component = "watcher",
        event = "watcher.started",
        path = %root.display(),
        poll_only = poll_only,
    );

    let (tail_tx, mut tail_rx) = mpsc::channel::<(String, TailEvent)>(1024);
    let mut tailers: HashMap<PathBuf, TailerHandle> = HashMap::new();

    for path in collect_jsonl_files(&root) {
        spawn_tailer(&root, &path, &pipeline, &mut tailers, tail_tx.clone());
    }

    let sweep_tx = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CATCHUP_SWEEP);
        loop {
            interval.tick().await;
            if sweep_tx.send(WatcherMessage::Sweep).is_err() {
                return;
            }
        }
    });

    let mut debounced: HashMap<PathBuf, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                match msg {
                    WatcherMessage::FsEvent(path) => {
                        if !is_session_file(&path) {
                            continue;
                        }
                        if let Some(handle) = debounced.remove(&path) {
                            handle.abort();
                        }
                        let inner_tx = tx.clone();
                        let debounced_path = path.clone();
                        debounced.insert(
                            path,
                            tokio::spawn(async move {
                                tokio::time::sleep(DEBOUNCE).await;
                                let _ = inner_tx.send(WatcherMessage::Settled(debounced_path));
                            }),
                        );
                    }
                    WatcherMessage::Settled(path) => {
                        debounced.remove(&path);
                        match tailers.get(&path) {
                            Some(handle) => handle.wake(),
                            None => spawn_tailer(&root, &path, &pipeline, &mut tailers, tail_tx.clone()),
                        }
                    }
                    WatcherMessage::Sweep => {
                        for path in collect_jsonl_files(&root) {
                            if !tailers.contains_key(&path) {
                                spawn_tailer(&root, &path, &pipeline, &mut tailers, tail_tx.clone());
                            }
                        }
                        tailers.retain(|path, handle| {
                            if path.exists() {
                                true
                            } else {
                                handle.task.abort();
                                let session_id = session_id_for(path);
                                pipeline.registry.mark_terminated(&session_id);
                                pipeline.broker.terminate(&session_id, "session file removed");
                                info!(
                                    component = "watcher",
                                    event = "watcher.session_terminated",
                                    session_id = %session_id,
                                );
                                false
                            }
                        });
                    }
                }
            }
            Some((session_id, event)) = tail_rx.recv() => {
                handle_tail_event(&pipeline, &session_id, event);
            }
            else => break,
        }
    }

    Ok(())
}

fn handle_tail_event(pipeline: &Pipeline, session_id: &str, event: TailEvent) {
    match event {
        TailEvent::Record { record, historical } => {
            pipeline.registry.mark_record(session_id, record.created_at);
            if !historical {
                if let Some(new_state) = pipeline.classifier.on_record(session_id, record.role, record.created_at) {
                    pipeline.broker.publish_message(
                        session_id,
                        relay_protocol::ServerMessage::SessionState {
                            session_id: session_id.to_string(),
                            state: new_state,
                            last_activity: Some(record.created_at),
                        },
                    );
                }
                if let Some(status) = matches_active_status(&pipeline.registry, session_id) {
                    pipeline.broker.publish_message(
                        session_id,
                        relay_protocol::ServerMessage::SessionStatus {
                            session_id: session_id.to_string(),
                            status,
                        },
                    );
                }
            } else {
                pipeline.classifier.seed(session_id, record.role, record.created_at);
            }
            pipeline.broker.publish_record(session_id, record, historical);
        }
        TailEvent::Malformed { .. } => {}
        TailEvent::Truncated => {
            warn!(component = "watcher", event = "watcher.file_truncated", session_id = %session_id);
        }
    }
}

fn matches_active_status(registry: &SessionRegistry, session_id: &str) -> Option<DescriptorStatus> {
    registry.get(session_id).map(|s| s.status)
}

fn spawn_tailer(
    root: &Path,
    path: &Path,
    pipeline: &Pipeline,
    tailers: &mut HashMap<PathBuf, TailerHandle>,
    tail_tx: mpsc::Sender<(String, TailEvent)>,
) {
    let session_id = session_id_for(path);
    let project_label = project_label_for(root, path);
    let newly_discovered = pipeline.registry.discover(&session_id, &project_label);
    if newly_discovered {
        pipeline.broker.broadcast_all(relay_protocol::ServerMessage::SessionNotification {
            kind: "discovered".to_string(),
            session_id: session_id.clone(),
            project_label: project_label.clone(),
        });
    }

    let (wake_tx, wake_rx) = mpsc::channel(4);
    let tailer = Tailer::new(path.to_path_buf(), session_id.clone());
    let task = tokio::spawn(tailer::run(tailer, tail_tx, wake_rx, Duration::from_secs(2)));

    tailers.insert(path.to_path_buf(), TailerHandle { task, wake_tx });

    info!(
        component = "watcher",
        event = "watcher.session_discovered",
        session_id = %session_id,
        path = %path.display(),
    );
}

fn is_session_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("jsonl")
        && !path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true)
}

fn session_id_for(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// The first path segment beneath `root` — not necessarily the file's
/// immediate parent, since a session file may sit arbitrarily deep under
/// its project directory.
fn project_label_for(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .and_then(|c| c.as_os_str().to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn collect_jsonl_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_session_file(&path) {
                out.push(path);
            }
        }
    }
    out
}

impl TailerHandle {
    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_the_file_stem() {
        let path = Path::new("/root/.claude/projects/foo/abcd1234.jsonl");
        assert_eq!(session_id_for(path), "abcd1234");
    }

    #[test]
    fn project_label_is_the_first_segment_under_root() {
        let root = Path::new("/root/.claude/projects");
        let path = Path::new("/root/.claude/projects/foo/abcd1234.jsonl");
        assert_eq!(project_label_for(root, path), "foo");
    }

    #[test]
    fn project_label_holds_for_nested_session_files() {
        let root = Path::new("/root/.claude/projects");
        let path = Path::new("/root/.claude/projects/foo/nested/deep/abcd1234.jsonl");
        assert_eq!(project_label_for(root, path), "foo");
    }

    #[test]
    fn dotfiles_are_not_session_files() {
        assert!(!is_session_file(Path::new("/tmp/.hidden.jsonl")));
        assert!(is_session_file(Path::new("/tmp/visible.jsonl")));
        assert!(!is_session_file(Path::new("/tmp/visible.txt")));
    }

    #[test]
    fn collect_jsonl_files_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("s1.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("s2.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), "").unwrap();

        let found = collect_jsonl_files(dir.path());
        assert_eq!(found.len(), 2);
    }
}
