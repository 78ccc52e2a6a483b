#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use courtside_domain::{QuotaCategory, UserId};
use courtside_protocol::codec::CodecError;
use courtside_protocol::version::SUBPROTOCOL;
use courtside_protocol::{ClientCommand, ServerEvent, decode_binary, decode_text};
use courtside_provider::SecretString;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::server::admission::{Admission, AdmissionController};
use crate::server::auth::{AuthClaims, verify_hmac_token};
use crate::server::registry::{Session, SessionRegistry, SessionSender};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub auth_hmac_secret: SecretString,
}

#[derive(Debug)]
enum HandshakeReject {
	UnsupportedProtocol,
	MissingCredential,
	InvalidCredential(String),
}

impl HandshakeReject {
	fn status(&self) -> StatusCode {
		match self {
			HandshakeReject::UnsupportedProtocol => StatusCode::BAD_REQUEST,
			HandshakeReject::MissingCredential | HandshakeReject::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
		}
	}
}

impl fmt::Display for HandshakeReject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HandshakeReject::UnsupportedProtocol => {
				write!(f, "unsupported sub-protocol (expected {SUBPROTOCOL} first)")
			}
			HandshakeReject::MissingCredential => f.write_str("missing credential"),
			HandshakeReject::InvalidCredential(detail) => write!(f, "invalid credential: {detail}"),
		}
	}
}

/// Accept one client connection: authenticate during the WebSocket
/// handshake, register the session, then pump frames until close.
///
/// An unauthenticated socket is refused before the upgrade completes; no
/// session state exists for it at any point.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	registry: Arc<SessionRegistry>,
	admission: Arc<AdmissionController>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("courtside_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("courtside_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut verified: Option<AuthClaims> = None;
	let secret = settings.auth_hmac_secret.clone();
	let callback = |request: &Request, mut response: Response| match authenticate_request(request, secret.expose()) {
		Ok(claims) => {
			response
				.headers_mut()
				.insert("sec-websocket-protocol", HeaderValue::from_static(SUBPROTOCOL));
			verified = Some(claims);
			Ok(response)
		}
		Err(reject) => {
			metrics::counter!("courtside_server_handshake_rejected_total").increment(1);
			warn!(conn_id, reason = %reject, "refusing connection before upgrade");
			Err(handshake_error(&reject))
		}
	};

	let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
		.await
		.context("websocket handshake")?;

	let claims = verified.ok_or_else(|| anyhow!("handshake completed without verified claims"))?;
	let identity = claims.identity();

	info!(conn_id, identity = %identity, "connection authenticated");
	metrics::counter!("courtside_server_connections_authenticated_total").increment(1);

	let (mut ws_sink, mut ws_stream) = ws.split();
	let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
	let sender = SessionSender::new(tx);

	registry.insert(conn_id, Session::new(identity.clone(), sender.clone())).await;

	// Single writer per connection; per-session ordering follows from the
	// one channel feeding it.
	tokio::spawn(async move {
		while let Some(message) = rx.recv().await {
			if ws_sink.send(message).await.is_err() {
				break;
			}
		}
		let _ = ws_sink.close().await;
	});

	sender.send_event(&ServerEvent::Welcome {
		identity: identity.to_string(),
		server_time_unix_ms: unix_ms_now(),
	});

	while let Some(message) = ws_stream.next().await {
		let message = match message {
			Ok(m) => m,
			Err(e) => {
				debug!(conn_id, error = %e, "websocket read failed");
				break;
			}
		};

		match message {
			Message::Binary(bytes) => {
				handle_frame(conn_id, decode_binary(&bytes), &registry, &admission, &identity, &sender).await;
			}
			Message::Text(text) => {
				handle_frame(
					conn_id,
					decode_text(text.as_str()),
					&registry,
					&admission,
					&identity,
					&sender,
				)
				.await;
			}
			Message::Ping(payload) => {
				let _ = sender.send_raw(Message::Pong(payload));
			}
			Message::Close(_) => break,
			Message::Pong(_) | Message::Frame(_) => {}
		}
	}

	// Removed synchronously on close; the next scheduler tick no longer
	// sees this session.
	registry.remove(conn_id).await;
	let open_sessions = registry.len().await;
	debug!(conn_id, open_sessions, "connection closed, session removed");

	Ok(())
}

/// Dispatch one decoded inbound frame. Never propagates: every failure mode
/// ends as an `error` event or a silent drop, with the session intact.
async fn handle_frame(
	conn_id: u64,
	decoded: Result<ClientCommand, CodecError>,
	registry: &SessionRegistry,
	admission: &AdmissionController,
	identity: &UserId,
	sender: &SessionSender,
) {
	match decoded {
		Ok(ClientCommand::State(snapshot)) => {
			metrics::counter!("courtside_server_state_frames_total").increment(1);

			match admission.try_consume(QuotaCategory::StateIngest, identity).await {
				Ok(Admission::Admitted) => {
					registry.update_state(conn_id, snapshot).await;
				}
				Ok(Admission::Rejected) => {
					metrics::counter!("courtside_server_state_frames_dropped_total").increment(1);
					debug!(conn_id, identity = %identity, "state frame dropped by admission");
				}
				Err(e) => {
					// State ingest fails open on store errors.
					warn!(conn_id, error = %e, "admission store error; admitting state frame");
					registry.update_state(conn_id, snapshot).await;
				}
			}
		}

		Ok(ClientCommand::CoachEnable(enabled)) => {
			registry.set_coach_enabled(conn_id, enabled).await;
			sender.send_event(&ServerEvent::CoachStatus { enabled });
			info!(conn_id, enabled, "coach toggled");
		}

		Ok(ClientCommand::Ping) => {
			sender.send_event(&ServerEvent::Pong);
		}

		Ok(ClientCommand::Unrecognized) => {
			metrics::counter!("courtside_server_frames_unrecognized_total").increment(1);
			sender.send_event(&ServerEvent::Error {
				message: "unrecognized message".to_string(),
			});
		}

		Err(e) => {
			metrics::counter!("courtside_server_frame_decode_errors_total").increment(1);
			sender.send_event(&ServerEvent::Error {
				message: format!("invalid frame: {e}"),
			});
		}
	}
}

fn authenticate_request(request: &Request, secret: &str) -> Result<AuthClaims, HandshakeReject> {
	let protocols = requested_protocols(request);
	if protocols.first().map(String::as_str) != Some(SUBPROTOCOL) {
		return Err(HandshakeReject::UnsupportedProtocol);
	}

	let credential = protocols.get(1).cloned().or_else(|| query_token(request));
	let Some(credential) = credential.filter(|c| !c.trim().is_empty()) else {
		return Err(HandshakeReject::MissingCredential);
	};

	verify_hmac_token(credential.trim(), secret).map_err(|e| HandshakeReject::InvalidCredential(e.to_string()))
}

fn requested_protocols(request: &Request) -> Vec<String> {
	request
		.headers()
		.get_all("sec-websocket-protocol")
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.map(|p| p.trim().to_string())
		.filter(|p| !p.is_empty())
		.collect()
}

/// `?token=` query fallback for clients that cannot set a second
/// sub-protocol token.
fn query_token(request: &Request) -> Option<String> {
	let query = request.uri().query()?;
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(key, _)| key == "token")
		.map(|(_, value)| value.into_owned())
}

fn handshake_error(reject: &HandshakeReject) -> ErrorResponse {
	let mut response = ErrorResponse::new(Some(reject.to_string()));
	*response.status_mut() = reject.status();
	response
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use courtside_domain::StateSnapshot;
	use serde_json::json;
	use tokio::sync::mpsc;
	use tokio_tungstenite::tungstenite::http;

	use super::*;
	use crate::server::admission::{AdmissionSettings, QuotaPolicy};
	use crate::server::auth::{AuthClaims, mint_hmac_token};

	fn token(secret: &str) -> String {
		let claims = AuthClaims {
			sub: Some("player-1".to_string()),
			role: Some("player".to_string()),
			exp: u64::MAX / 2,
		};
		mint_hmac_token(&claims, secret).expect("mint")
	}

	fn request(protocols: Option<&str>, uri: &str) -> Request {
		let mut builder = http::Request::builder().method("GET").uri(uri);
		if let Some(p) = protocols {
			builder = builder.header("sec-websocket-protocol", p);
		}
		builder.body(()).expect("request")
	}

	#[test]
	fn accepts_token_as_second_subprotocol() {
		let token = token("s3cret");
		let req = request(Some(&format!("{SUBPROTOCOL}, {token}")), "/ws");

		let claims = authenticate_request(&req, "s3cret").expect("authenticated");
		assert_eq!(claims.identity().as_str(), "player-1");
	}

	#[test]
	fn accepts_token_as_query_parameter() {
		let token = token("s3cret");
		let req = request(Some(SUBPROTOCOL), &format!("/ws?token={token}"));

		let claims = authenticate_request(&req, "s3cret").expect("authenticated");
		assert_eq!(claims.identity().as_str(), "player-1");
	}

	#[test]
	fn rejects_wrong_first_subprotocol() {
		let token = token("s3cret");
		let req = request(Some(&format!("other.v1, {token}")), "/ws");

		let reject = authenticate_request(&req, "s3cret").unwrap_err();
		assert_eq!(reject.status(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn rejects_missing_credential() {
		let req = request(Some(SUBPROTOCOL), "/ws");
		let reject = authenticate_request(&req, "s3cret").unwrap_err();
		assert_eq!(reject.status(), StatusCode::UNAUTHORIZED);
		assert!(matches!(reject, HandshakeReject::MissingCredential));
	}

	#[test]
	fn rejects_invalid_credential() {
		let req = request(Some(&format!("{SUBPROTOCOL}, not-a-token")), "/ws");
		let reject = authenticate_request(&req, "s3cret").unwrap_err();
		assert_eq!(reject.status(), StatusCode::UNAUTHORIZED);
	}

	#[test]
	fn rejects_token_signed_with_other_secret() {
		let token = token("other-secret");
		let req = request(Some(&format!("{SUBPROTOCOL}, {token}")), "/ws");
		assert!(authenticate_request(&req, "s3cret").is_err());
	}

	#[test]
	fn no_protocols_at_all_is_rejected() {
		let req = request(None, "/ws");
		let reject = authenticate_request(&req, "s3cret").unwrap_err();
		assert!(matches!(reject, HandshakeReject::UnsupportedProtocol));
	}

	fn registered_session() -> (
		Arc<SessionRegistry>,
		UserId,
		SessionSender,
		mpsc::UnboundedReceiver<Message>,
	) {
		let registry = Arc::new(SessionRegistry::new());
		let identity = UserId::new("player-1").expect("valid UserId");
		let (tx, rx) = mpsc::unbounded_channel();
		let sender = SessionSender::new(tx);
		(registry, identity, sender, rx)
	}

	fn state_command(ball_x: f64) -> Result<ClientCommand, CodecError> {
		Ok(ClientCommand::State(StateSnapshot::new(json!({ "ballX": ball_x }))))
	}

	fn drain_events(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerEvent> {
		let mut events = Vec::new();
		while let Ok(message) = rx.try_recv() {
			let Message::Text(text) = message else {
				panic!("outbound frames are always textual, got: {message:?}");
			};
			events.push(serde_json::from_str(text.as_str()).expect("well-formed event frame"));
		}
		events
	}

	#[tokio::test]
	async fn sixth_state_frame_in_one_window_is_dropped_silently() {
		let (registry, identity, sender, mut rx) = registered_session();
		registry.insert(1, Session::new(identity.clone(), sender.clone())).await;

		let admission = AdmissionController::in_memory(AdmissionSettings {
			state_ingest: QuotaPolicy {
				points: 5,
				window: Duration::from_secs(1),
			},
			commentary_call: QuotaPolicy {
				points: 40,
				window: Duration::from_secs(60),
			},
		});

		for i in 0..6 {
			handle_frame(
				1,
				state_command(f64::from(i)),
				&registry,
				&admission,
				&identity,
				&sender,
			)
			.await;
		}

		// The 6th frame mutates nothing and produces no outbound event.
		assert!(drain_events(&mut rx).is_empty());
		let due = registry.due_for_commentary(1_000_000, 0).await;
		assert_eq!(due.len(), 1);
		assert_eq!(due[0].snapshot.ball_x(), Some(4.0));
	}

	#[tokio::test]
	async fn decode_errors_and_unknown_shapes_report_without_touching_state() {
		let (registry, identity, sender, mut rx) = registered_session();
		registry.insert(1, Session::new(identity.clone(), sender.clone())).await;

		let admission = AdmissionController::in_memory(AdmissionSettings::default());

		handle_frame(
			1,
			decode_text("{not json"),
			&registry,
			&admission,
			&identity,
			&sender,
		)
		.await;
		handle_frame(
			1,
			Ok(ClientCommand::Unrecognized),
			&registry,
			&admission,
			&identity,
			&sender,
		)
		.await;

		let events = drain_events(&mut rx);
		assert_eq!(events.len(), 2);
		assert!(events.iter().all(|e| matches!(e, ServerEvent::Error { .. })));

		// The session never saw a snapshot.
		assert!(registry.due_for_commentary(1_000_000, 0).await.is_empty());
	}

	#[tokio::test]
	async fn ping_and_coach_toggle_round_trip() {
		let (registry, identity, sender, mut rx) = registered_session();
		registry.insert(1, Session::new(identity.clone(), sender.clone())).await;

		let admission = AdmissionController::in_memory(AdmissionSettings::default());

		handle_frame(1, Ok(ClientCommand::Ping), &registry, &admission, &identity, &sender).await;
		handle_frame(
			1,
			Ok(ClientCommand::CoachEnable(true)),
			&registry,
			&admission,
			&identity,
			&sender,
		)
		.await;

		let events = drain_events(&mut rx);
		assert_eq!(events, vec![ServerEvent::Pong, ServerEvent::CoachStatus { enabled: true }]);
	}
}
