//! Editor-side sync agent: debounced edit coalescing and echo suppression.
//!
//! ## Architecture
//!
//! ```text
//! Local keystroke                     Remote code-update
//!       │                                   │
//!       ▼                                   ▼
//! EditorAgent::on_local_edit()       EditorAgent::apply_remote()
//!       │  (debounced: 300ms,              │  (self-echo discarded,
//!       │   latest value wins)             │   applying-remote set)
//!       ▼                                   ▼
//! ClientEvent::CodeChange            buffer replaced, cursor clamped
//! ```
//!
//! ## Echo suppression
//!
//! Applying a remote update replaces the buffer, and the host editor then
//! fires its ordinary change notification for that replacement — the same
//! path a keystroke takes. The `applying_remote` flag tells the two apart:
//! [`EditorAgent::apply_remote`] sets it, and the NEXT call to
//! [`EditorAgent::on_local_edit`] clears it and emits nothing. The flag must
//! only ever be cleared by that next notification; clearing it eagerly at
//! apply time would let the feedback notification re-emit the remote value
//! as a local edit.
//!
//! ## Debounce
//!
//! Successive local edits within the window are coalesced into a single
//! outbound `code-change` carrying only the final buffer — a timer reset on
//! every keystroke, not a queue. The pending timer is cancelled on teardown
//! so no stale emission can fire after the agent is dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::protocol::{ClientEvent, CursorPosition, ServerEvent};

/// Delay before a burst of local edits is flushed as one `code-change`.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

struct EditorShared {
    code: String,
    language: String,
    cursor: CursorPosition,
    /// Set by `apply_remote`, cleared by the next `on_local_edit`.
    applying_remote: bool,
    /// Pending debounce timer, if any.
    pending: Option<JoinHandle<()>>,
}

/// Per-client sync agent for one joined room.
///
/// Emits outbound [`ClientEvent`]s on the channel handed to [`new`]
/// (normally [`crate::client::CollabClient::sender`]); the host feeds
/// editor callbacks in and applies received [`ServerEvent`]s via
/// [`apply_remote`].
///
/// [`new`]: EditorAgent::new
/// [`apply_remote`]: EditorAgent::apply_remote
pub struct EditorAgent {
    shared: Arc<Mutex<EditorShared>>,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
    room_id: String,
    user_id: String,
    user_name: String,
    debounce: Duration,
}

impl EditorAgent {
    /// Create an agent for the given room and local user.
    pub fn new(
        outgoing: mpsc::UnboundedSender<ClientEvent>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self::with_debounce(outgoing, room_id, user_id, user_name, DEBOUNCE_WINDOW)
    }

    /// Create with a custom debounce window (for testing).
    pub fn with_debounce(
        outgoing: mpsc::UnboundedSender<ClientEvent>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(EditorShared {
                code: String::new(),
                language: "javascript".to_string(),
                cursor: CursorPosition::default(),
                applying_remote: false,
                pending: None,
            })),
            outgoing,
            room_id: room_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            debounce,
        }
    }

    /// Handle a change notification from the host editor.
    ///
    /// If the change is the feedback from a just-applied remote update, the
    /// applying-remote flag is consumed and nothing is emitted. Otherwise the
    /// buffer is updated and the debounce timer restarted; when it expires,
    /// one `code-change` with the latest buffer goes out.
    pub async fn on_local_edit(&self, code: impl Into<String>) {
        let mut shared = self.shared.lock().await;
        if shared.applying_remote {
            shared.applying_remote = false;
            return;
        }
        shared.code = code.into();

        if let Some(pending) = shared.pending.take() {
            pending.abort();
        }

        let state = self.shared.clone();
        let outgoing = self.outgoing.clone();
        let room_id = self.room_id.clone();
        let user_id = self.user_id.clone();
        let delay = self.debounce;
        shared.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut shared = state.lock().await;
            shared.pending = None;
            let _ = outgoing.send(ClientEvent::CodeChange {
                room_id,
                code: shared.code.clone(),
                language: shared.language.clone(),
                user_id,
            });
        }));
    }

    /// Apply an inbound hub event to local state.
    ///
    /// `code-update` from the local user is discarded (protocol-level
    /// self-echo guard, independent of the applying-remote flag). A remote
    /// update overwrites the buffer — last writer wins, no merging — and the
    /// cursor is clamped to the new text on a best-effort basis.
    pub async fn apply_remote(&self, event: &ServerEvent) {
        match event {
            ServerEvent::CodeUpdate { code, user_id, .. } => {
                if *user_id == self.user_id {
                    return;
                }
                let mut shared = self.shared.lock().await;
                shared.applying_remote = true;
                shared.code = code.clone();
                shared.cursor = clamp_cursor(shared.cursor, &shared.code);
            }
            ServerEvent::LanguageUpdate { language, user_id } => {
                if *user_id == self.user_id {
                    return;
                }
                let mut shared = self.shared.lock().await;
                shared.language = language.clone();
            }
            // Membership, cursor, and run events are presentation concerns;
            // the host consumes them directly.
            _ => {}
        }
    }

    /// Relay a cursor move immediately (no coalescing).
    pub async fn on_cursor_moved(&self, position: CursorPosition) {
        self.shared.lock().await.cursor = position;
        let _ = self.outgoing.send(ClientEvent::CursorChange {
            room_id: self.room_id.clone(),
            position,
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
        });
    }

    /// Switch the local language and relay it immediately.
    pub async fn set_language(&self, language: impl Into<String>) {
        let language = language.into();
        self.shared.lock().await.language = language.clone();
        let _ = self.outgoing.send(ClientEvent::LanguageChange {
            room_id: self.room_id.clone(),
            language,
        });
    }

    /// Ask every room member to execute the current buffer.
    pub async fn run_code(&self) {
        let shared = self.shared.lock().await;
        let _ = self.outgoing.send(ClientEvent::RunCode {
            room_id: self.room_id.clone(),
            code: shared.code.clone(),
            language: shared.language.clone(),
            user_id: self.user_id.clone(),
        });
    }

    /// Current buffer.
    pub async fn code(&self) -> String {
        self.shared.lock().await.code.clone()
    }

    /// Current language selection.
    pub async fn language(&self) -> String {
        self.shared.lock().await.language.clone()
    }

    /// Current cursor position.
    pub async fn cursor(&self) -> CursorPosition {
        self.shared.lock().await.cursor
    }

    /// Whether the next change notification will be swallowed as echo.
    pub async fn applying_remote(&self) -> bool {
        self.shared.lock().await.applying_remote
    }

    /// The room this agent belongs to.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Cancel any pending debounce timer.
    pub async fn shutdown(&self) {
        if let Some(pending) = self.shared.lock().await.pending.take() {
            pending.abort();
        }
    }
}

impl Drop for EditorAgent {
    fn drop(&mut self) {
        // Best-effort: a timer task currently holding the lock is about to
        // finish anyway; otherwise cancel it so nothing fires after disposal.
        if let Ok(mut shared) = self.shared.try_lock() {
            if let Some(pending) = shared.pending.take() {
                pending.abort();
            }
        }
    }
}

/// Clamp a cursor to the given text, line first, then column within it.
fn clamp_cursor(position: CursorPosition, text: &str) -> CursorPosition {
    let line_count = text.lines().count() as u32;
    if line_count == 0 {
        return CursorPosition::default();
    }
    let line = position.line.min(line_count - 1);
    let column_max = text
        .lines()
        .nth(line as usize)
        .map(|l| l.chars().count() as u32)
        .unwrap_or(0);
    CursorPosition {
        line,
        column: position.column.min(column_max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{sleep, timeout};

    const TEST_WINDOW: Duration = Duration::from_millis(25);

    fn agent() -> (EditorAgent, UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = EditorAgent::with_debounce(tx, "r1", "u1", "Alice", TEST_WINDOW);
        (agent, rx)
    }

    async fn expect_none(rx: &mut UnboundedReceiver<ClientEvent>) {
        assert!(
            timeout(TEST_WINDOW * 4, rx.recv()).await.is_err(),
            "expected no outbound event"
        );
    }

    #[tokio::test]
    async fn test_debounce_coalesces_burst() {
        let (agent, mut rx) = agent();

        agent.on_local_edit("x").await;
        agent.on_local_edit("x =").await;
        agent.on_local_edit("x = 1").await;

        let event = timeout(TEST_WINDOW * 4, rx.recv())
            .await
            .expect("debounce should flush")
            .unwrap();
        match event {
            ClientEvent::CodeChange { code, user_id, .. } => {
                assert_eq!(code, "x = 1");
                assert_eq!(user_id, "u1");
            }
            other => panic!("Expected code-change, got {other:?}"),
        }

        // Exactly one — the intermediate values were discarded.
        expect_none(&mut rx).await;
    }

    #[tokio::test]
    async fn test_debounce_timer_resets_per_keystroke() {
        let (agent, mut rx) = agent();

        agent.on_local_edit("a").await;
        sleep(TEST_WINDOW / 2).await;
        agent.on_local_edit("ab").await;
        sleep(TEST_WINDOW / 2).await;

        // Still inside the (restarted) window.
        assert!(rx.try_recv().is_err());

        let event = timeout(TEST_WINDOW * 4, rx.recv()).await.unwrap().unwrap();
        match event {
            ClientEvent::CodeChange { code, .. } => assert_eq!(code, "ab"),
            other => panic!("Expected code-change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_apply_suppresses_feedback_echo() {
        let (agent, mut rx) = agent();

        agent
            .apply_remote(&ServerEvent::CodeUpdate {
                code: "from_bob".into(),
                language: "python".into(),
                user_id: "u2".into(),
                timestamp: 1,
            })
            .await;
        assert_eq!(agent.code().await, "from_bob");
        assert!(agent.applying_remote().await);

        // The host editor echoes the replacement through the change path.
        agent.on_local_edit("from_bob").await;
        assert!(!agent.applying_remote().await);
        expect_none(&mut rx).await;

        // A genuine edit afterwards flows normally.
        agent.on_local_edit("from_bob + 1").await;
        let event = timeout(TEST_WINDOW * 4, rx.recv()).await.unwrap().unwrap();
        match event {
            ClientEvent::CodeChange { code, .. } => assert_eq!(code, "from_bob + 1"),
            other => panic!("Expected code-change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_self_echo_guard_discards_own_update() {
        let (agent, _rx) = agent();
        agent.on_local_edit("mine").await;

        agent
            .apply_remote(&ServerEvent::CodeUpdate {
                code: "stale".into(),
                language: "python".into(),
                user_id: "u1".into(), // our own id
                timestamp: 1,
            })
            .await;

        assert_eq!(agent.code().await, "mine");
        assert!(!agent.applying_remote().await);
    }

    #[tokio::test]
    async fn test_language_sync() {
        let (agent, mut rx) = agent();

        agent.set_language("rust").await;
        // Immediate, not debounced.
        match rx.try_recv().unwrap() {
            ClientEvent::LanguageChange { language, .. } => assert_eq!(language, "rust"),
            other => panic!("Expected language-change, got {other:?}"),
        }

        agent
            .apply_remote(&ServerEvent::LanguageUpdate {
                language: "go".into(),
                user_id: "u2".into(),
            })
            .await;
        assert_eq!(agent.language().await, "go");

        // Our own language-update reflected back is ignored.
        agent
            .apply_remote(&ServerEvent::LanguageUpdate {
                language: "c".into(),
                user_id: "u1".into(),
            })
            .await;
        assert_eq!(agent.language().await, "go");
    }

    #[tokio::test]
    async fn test_cursor_relayed_immediately() {
        let (agent, mut rx) = agent();

        agent.on_cursor_moved(CursorPosition::new(2, 7)).await;
        match rx.try_recv().unwrap() {
            ClientEvent::CursorChange { position, user_name, .. } => {
                assert_eq!(position, CursorPosition::new(2, 7));
                assert_eq!(user_name, "Alice");
            }
            other => panic!("Expected cursor-change, got {other:?}"),
        }
        assert_eq!(agent.cursor().await, CursorPosition::new(2, 7));
    }

    #[tokio::test]
    async fn test_cursor_clamped_on_remote_replacement() {
        let (agent, _rx) = agent();
        agent.on_local_edit("line one\nline two\nline three").await;
        agent.on_cursor_moved(CursorPosition::new(2, 10)).await;

        agent
            .apply_remote(&ServerEvent::CodeUpdate {
                code: "short".into(),
                language: "python".into(),
                user_id: "u2".into(),
                timestamp: 1,
            })
            .await;

        assert_eq!(agent.cursor().await, CursorPosition::new(0, 5));
    }

    #[tokio::test]
    async fn test_run_code_carries_current_buffer() {
        let (agent, mut rx) = agent();
        agent.on_local_edit("print(42)").await;
        agent.run_code().await;

        match rx.try_recv().unwrap() {
            ClientEvent::RunCode { code, user_id, .. } => {
                assert_eq!(code, "print(42)");
                assert_eq!(user_id, "u1");
            }
            other => panic!("Expected run-code, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_flush() {
        let (agent, mut rx) = agent();
        agent.on_local_edit("doomed").await;
        agent.shutdown().await;
        expect_none(&mut rx).await;
    }

    #[test]
    fn test_clamp_cursor() {
        let text = "ab\ncdef";
        assert_eq!(
            clamp_cursor(CursorPosition::new(0, 1), text),
            CursorPosition::new(0, 1)
        );
        assert_eq!(
            clamp_cursor(CursorPosition::new(5, 3), text),
            CursorPosition::new(1, 3)
        );
        assert_eq!(
            clamp_cursor(CursorPosition::new(0, 99), text),
            CursorPosition::new(0, 2)
        );
        assert_eq!(
            clamp_cursor(CursorPosition::new(3, 3), ""),
            CursorPosition::default()
        );
    }
}
