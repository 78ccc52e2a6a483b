#![forbid(unsafe_code)]

use std::collections::HashMap;

use courtside_domain::{StateSnapshot, UserId};
use courtside_protocol::{ServerEvent, encode_event};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::warn;

/// Handle for pushing outbound frames to one connection.
///
/// All events for a session flow through one channel, which is what keeps
/// chunk events ordered before their final aggregate. A vanished connection
/// surfaces as a failed send and is skipped silently.
#[derive(Debug, Clone)]
pub struct SessionSender {
	tx: mpsc::UnboundedSender<Message>,
}

impl SessionSender {
	pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
		Self { tx }
	}

	/// Encode and queue one event for delivery.
	pub fn send_event(&self, event: &ServerEvent) -> bool {
		match encode_event(event) {
			Ok(json) => self.tx.send(Message::text(json)).is_ok(),
			Err(e) => {
				warn!(error = %e, "failed to encode outbound event");
				false
			}
		}
	}

	pub fn send_raw(&self, message: Message) -> bool {
		self.tx.send(message).is_ok()
	}
}

/// Per-connection session record.
///
/// Every mutation is a single-field overwrite (latest state wins, nothing is
/// queued), so field-level update under the registry lock is sufficient.
#[derive(Debug)]
pub struct Session {
	pub identity: UserId,
	pub last_state: Option<StateSnapshot>,
	pub last_commentary_at: i64,
	pub last_coach_at: i64,
	pub coach_enabled: bool,
	pub sender: SessionSender,
}

impl Session {
	pub fn new(identity: UserId, sender: SessionSender) -> Self {
		Self {
			identity,
			last_state: None,
			last_commentary_at: 0,
			last_coach_at: 0,
			coach_enabled: false,
			sender,
		}
	}
}

/// Work item for one session whose scheduling gate passed this tick.
#[derive(Debug, Clone)]
pub struct DueSession {
	pub conn_id: u64,
	pub identity: UserId,
	pub snapshot: StateSnapshot,
	pub sender: SessionSender,
}

/// Process-owned table of open connections.
///
/// Owned by the server process and passed by handle into the frame handler
/// and both scheduler loops; entries live exactly as long as the connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: RwLock<HashMap<u64, Session>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert(&self, conn_id: u64, session: Session) {
		self.sessions.write().await.insert(conn_id, session);
	}

	/// Remove on close. In-flight generations for the session keep their
	/// sender clone and fail silently once the writer is gone.
	pub async fn remove(&self, conn_id: u64) {
		self.sessions.write().await.remove(&conn_id);
	}

	pub async fn len(&self) -> usize {
		self.sessions.read().await.len()
	}

	/// Overwrite the session's snapshot; returns false for a vanished session.
	pub async fn update_state(&self, conn_id: u64, snapshot: StateSnapshot) -> bool {
		match self.sessions.write().await.get_mut(&conn_id) {
			Some(session) => {
				session.last_state = Some(snapshot);
				true
			}
			None => false,
		}
	}

	pub async fn set_coach_enabled(&self, conn_id: u64, enabled: bool) -> bool {
		match self.sessions.write().await.get_mut(&conn_id) {
			Some(session) => {
				session.coach_enabled = enabled;
				true
			}
			None => false,
		}
	}

	/// Sessions due for commentary at `now_ms`.
	///
	/// The timestamp is advanced while still under the lock, before any
	/// generation starts, so a slow or streaming call cannot double-fire on
	/// the next tick and a rejected call is not retried every tick.
	pub async fn due_for_commentary(&self, now_ms: i64, interval_ms: i64) -> Vec<DueSession> {
		let mut sessions = self.sessions.write().await;
		let mut due = Vec::new();

		for (conn_id, session) in sessions.iter_mut() {
			let Some(snapshot) = session.last_state.as_ref() else {
				continue;
			};
			if now_ms - session.last_commentary_at < interval_ms {
				continue;
			}

			session.last_commentary_at = now_ms;
			due.push(DueSession {
				conn_id: *conn_id,
				identity: session.identity.clone(),
				snapshot: snapshot.clone(),
				sender: session.sender.clone(),
			});
		}

		due
	}

	/// Same gate for coaching, additionally requiring the session opt-in.
	pub async fn due_for_coach(&self, now_ms: i64, interval_ms: i64) -> Vec<DueSession> {
		let mut sessions = self.sessions.write().await;
		let mut due = Vec::new();

		for (conn_id, session) in sessions.iter_mut() {
			if !session.coach_enabled {
				continue;
			}
			let Some(snapshot) = session.last_state.as_ref() else {
				continue;
			};
			if now_ms - session.last_coach_at < interval_ms {
				continue;
			}

			session.last_coach_at = now_ms;
			due.push(DueSession {
				conn_id: *conn_id,
				identity: session.identity.clone(),
				snapshot: snapshot.clone(),
				sender: session.sender.clone(),
			});
		}

		due
	}
}
