//! RTSP method handlers
//!
//! Every request runs the same preamble — Apple-Challenge, CSeq echo, Server
//! header, the authentication gate — and is then dispatched by method. A
//! handler's whole job is to set the response code (plus headers/body) and
//! keep the session state honest; apart from OPTIONS, the session verbs all
//! require that this connection owns the player.

use std::str::FromStr;

use crate::metadata::codes;
use crate::protocol::dmap;
use crate::protocol::rtsp::{
    Method, RtspMessage, SERVER_IDENT, SharedMessage, TransportHeader, apple_response,
    check_authorization, header_field, response_transport, status,
};
use crate::protocol::sdp::{AnnounceDescription, tolerant_lines};

use super::connection::Connection;
use super::server::ReceiverContext;
use super::session::StreamConfig;
use super::slot::{ACQUIRE_BUDGET, AcquireOutcome};

/// The methods advertised in OPTIONS.
const PUBLIC_METHODS: &str = "ANNOUNCE, SETUP, RECORD, PAUSE, FLUSH, TEARDOWN, OPTIONS, \
                              GET_PARAMETER, SET_PARAMETER";

/// Latency reported in the RECORD response, in frames.
///
/// The absolute minimum the pipeline imposes; the sender adds its own figure
/// to this. AirPlay's 77175 plus this gives exactly 88200.
const AUDIO_LATENCY: u32 = 11025;

/// Run the full request pipeline and fill in the response.
pub(crate) async fn handle_request(
    ctx: &ReceiverContext,
    conn: &mut Connection,
    req: &SharedMessage,
    resp: &mut RtspMessage,
) {
    if let Some(challenge) = req.headers.get("Apple-Challenge") {
        if let Some(key) = &ctx.config.airplay_key {
            if let Some(response) = apple_response(key, challenge, conn.local.ip(), &ctx.config.hw_addr)
            {
                resp.headers.add("Apple-Response", response);
            }
        } else {
            tracing::debug!(
                "connection {}: Apple-Challenge received but no key is configured",
                conn.handle.number()
            );
        }
    }

    if let Some(cseq) = req.headers.get("CSeq") {
        resp.headers.add("CSeq", cseq);
    }
    resp.headers.add("Server", SERVER_IDENT);

    if !conn.authorized
        && !check_authorization(ctx.config.password.as_deref(), &mut conn.auth_nonce, req, resp)
    {
        return;
    }
    conn.authorized = true;

    let method = req.method.as_deref().unwrap_or("");
    match Method::from_str(method) {
        Ok(Method::Options) => handle_options(conn, resp),
        Ok(Method::Announce) => handle_announce(ctx, conn, req, resp).await,
        Ok(Method::Setup) => handle_setup(ctx, conn, req, resp).await,
        Ok(Method::Record) => handle_record(ctx, conn, req, resp).await,
        Ok(Method::Pause) => handle_pause(ctx, conn, resp),
        Ok(Method::Flush) => handle_flush(ctx, conn, req, resp).await,
        Ok(Method::Teardown) => handle_teardown(ctx, conn, resp).await,
        Ok(Method::GetParameter) => handle_get_parameter(ctx, conn, req, resp),
        Ok(Method::SetParameter) => handle_set_parameter(ctx, conn, req, resp).await,
        Err(()) => {
            tracing::debug!(
                "connection {}: unrecognised and unhandled rtsp request {method:?}",
                conn.handle.number()
            );
        }
    }
}

/// Check player ownership for a session verb; answers 451 when not owned.
fn have_player(ctx: &ReceiverContext, conn: &Connection, verb: &str, resp: &mut RtspMessage) -> bool {
    if ctx.slot.holder_is(&conn.handle) {
        true
    } else {
        tracing::warn!(
            "connection {} {verb} received without having the player (no ANNOUNCE?)",
            conn.handle.number()
        );
        resp.respcode = status::NO_PLAYER;
        false
    }
}

fn handle_options(conn: &Connection, resp: &mut RtspMessage) {
    tracing::debug!("connection {}: OPTIONS", conn.handle.number());
    resp.respcode = status::OK;
    resp.headers.add("Public", PUBLIC_METHODS);
}

async fn handle_announce(
    ctx: &ReceiverContext,
    conn: &mut Connection,
    req: &SharedMessage,
    resp: &mut RtspMessage,
) {
    tracing::debug!("connection {}: ANNOUNCE", conn.handle.number());

    match ctx
        .slot
        .acquire(&conn.handle, ctx.config.allow_session_interruption, ACQUIRE_BUDGET)
        .await
    {
        AcquireOutcome::Busy => {
            tracing::debug!(
                "connection {}: ANNOUNCE failed because another connection is already playing",
                conn.handle.number()
            );
            resp.respcode = status::SESSION_BUSY;
            return;
        }
        AcquireOutcome::Acquired { interrupted } => {
            // a session that did not break in may reuse the port range
            if !interrupted {
                ctx.rtp.reset_port_range();
            }
        }
    }

    resp.respcode = status::UNSUPPORTED_STREAM;

    let desc = AnnounceDescription::parse(&req.content);
    if let Some(sid) = desc.session_id {
        tracing::debug!("synchronisation source identifier: {sid:08X},{sid}");
    }

    match StreamConfig::from_announce(&desc, ctx.config.airplay_key.as_deref()) {
        Ok(stream) => {
            conn.stream = Some(stream);

            if let Some(name) = req.headers.get("X-Apple-Client-Name") {
                tracing::debug!(
                    "play connection from device named {name:?} on RTSP conversation {}",
                    conn.handle.number()
                );
                ctx.metadata
                    .publish_ssnc(codes::CLIENT_NAME, name.as_bytes(), Some(req));
            }
            if let Some(agent) = req.headers.get("User-Agent") {
                tracing::debug!(
                    "play connection from user agent {agent:?} on RTSP conversation {}",
                    conn.handle.number()
                );
                conn.user_agent = Some(agent.to_string());
                conn.airplay_version = airplay_version(agent);
                ctx.metadata
                    .publish_ssnc(codes::USER_AGENT, agent.as_bytes(), Some(req));
            }

            resp.respcode = status::OK;
        }
        Err(e) => {
            tracing::warn!(
                "connection {}: can not process the ANNOUNCE message: {e}",
                conn.handle.number()
            );
        }
    }

    if resp.respcode != status::OK && resp.respcode != status::SESSION_BUSY {
        tracing::debug!(
            "connection {}: error in handling ANNOUNCE, unlocking the play lock",
            conn.handle.number()
        );
        ctx.slot.release_if(&conn.handle);
    }
}

/// Parse the version digits out of a `User-Agent: AirPlay/353.2` string.
fn airplay_version(agent: &str) -> Option<u32> {
    let after = agent.split("AirPlay").nth(1)?;
    let after_slash = after.split('/').nth(1)?;
    let digits: String = after_slash
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

async fn handle_setup(
    ctx: &ReceiverContext,
    conn: &mut Connection,
    req: &SharedMessage,
    resp: &mut RtspMessage,
) {
    tracing::debug!("connection {}: SETUP", conn.handle.number());
    if !have_player(ctx, conn, "SETUP", resp) {
        return;
    }
    resp.respcode = status::NO_PLAYER; // expect trouble until the transport checks out

    // identity headers replace anything a previous SETUP captured
    match req.headers.get("Active-Remote") {
        Some(active_remote) => {
            conn.dacp_active_remote = Some(active_remote.to_string());
            ctx.metadata
                .publish_ssnc(codes::ACTIVE_REMOTE, active_remote.as_bytes(), Some(req));
        }
        None => conn.dacp_active_remote = None,
    }
    match req.headers.get("DACP-ID") {
        Some(dacp_id) => {
            conn.dacp_id = Some(dacp_id.to_string());
            ctx.metadata
                .publish_ssnc(codes::DACP_ID, dacp_id.as_bytes(), Some(req));
        }
        None => conn.dacp_id = None,
    }

    match req.headers.get("Transport").map(TransportHeader::parse) {
        Some(Ok(transport)) => {
            if conn.rtp_running {
                if conn.remote_control_port != transport.control_port
                    || conn.remote_timing_port != transport.timing_port
                {
                    tracing::warn!(
                        "connection {}: duplicate SETUP with different control (old {}, new {}) or \
                         timing (old {}, new {}) ports! This is probably fatal!",
                        conn.handle.number(),
                        conn.remote_control_port,
                        transport.control_port,
                        conn.remote_timing_port,
                        transport.timing_port
                    );
                } else {
                    tracing::warn!(
                        "connection {}: duplicate SETUP with the same control ({}) and timing ({}) \
                         ports. This is probably not fatal.",
                        conn.handle.number(),
                        conn.remote_control_port,
                        conn.remote_timing_port
                    );
                }
            } else {
                match ctx
                    .rtp
                    .setup(
                        conn.handle.number(),
                        conn.local,
                        conn.remote,
                        transport.control_port,
                        transport.timing_port,
                    )
                    .await
                {
                    Ok(ports) => {
                        conn.local_ports = Some(ports);
                        conn.rtp_running = true;
                        conn.remote_control_port = transport.control_port;
                        conn.remote_timing_port = transport.timing_port;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "connection {}: could not set up the RTP transport: {e}",
                            conn.handle.number()
                        );
                    }
                }
            }
        }
        Some(Err(e)) => {
            tracing::debug!("connection {}: {e}", conn.handle.number());
        }
        None => {
            tracing::debug!(
                "connection {}: SETUP doesn't contain a Transport header",
                conn.handle.number()
            );
        }
    }

    match conn.local_ports {
        Some(ports) if ports.audio != 0 => {
            resp.headers.add(
                "Transport",
                response_transport(ports.control, ports.timing, ports.audio),
            );
            resp.headers.add("Session", "1");
            resp.respcode = status::OK;
            tracing::debug!(
                "connection {}: SETUP DACP-ID {:?} from {} to {} with UDP ports control: {}, \
                 timing: {} and audio: {}",
                conn.handle.number(),
                conn.dacp_id,
                conn.remote,
                conn.local,
                ports.control,
                ports.timing,
                ports.audio
            );
        }
        Some(_) => {
            tracing::debug!(
                "connection {}: SETUP seems to specify a null audio port",
                conn.handle.number()
            );
        }
        None => {}
    }

    if resp.respcode != status::OK {
        tracing::debug!(
            "connection {}: SETUP error -- releasing the player lock",
            conn.handle.number()
        );
        ctx.slot.release_if(&conn.handle);
    }
}

async fn handle_record(
    ctx: &ReceiverContext,
    conn: &mut Connection,
    req: &SharedMessage,
    resp: &mut RtspMessage,
) {
    tracing::debug!("connection {}: RECORD", conn.handle.number());
    if !have_player(ctx, conn, "RECORD", resp) {
        return;
    }

    if conn.player_running {
        tracing::warn!(
            "connection {}: RECORD: duplicate RECORD message -- ignored",
            conn.handle.number()
        );
    } else if let Some(stream) = &conn.stream {
        ctx.player.play(conn.handle.number(), stream).await;
        conn.player_running = true;
    } else {
        tracing::warn!(
            "connection {}: RECORD without stream parameters",
            conn.handle.number()
        );
    }

    resp.respcode = status::OK;
    resp.headers.add("Audio-Latency", AUDIO_LATENCY.to_string());

    if let Some(rtptime) = request_rtptime(req) {
        ctx.player.flush(rtptime).await;
    }
}

fn handle_pause(ctx: &ReceiverContext, conn: &mut Connection, resp: &mut RtspMessage) {
    tracing::debug!("connection {}: PAUSE", conn.handle.number());
    if !have_player(ctx, conn, "PAUSE", resp) {
        return;
    }
    // pause is advisory; the player follows the control stream
    resp.respcode = status::OK;
}

async fn handle_flush(
    ctx: &ReceiverContext,
    conn: &mut Connection,
    req: &SharedMessage,
    resp: &mut RtspMessage,
) {
    tracing::debug!("connection {}: FLUSH", conn.handle.number());
    if !have_player(ctx, conn, "FLUSH", resp) {
        return;
    }
    ctx.player.flush(request_rtptime(req).unwrap_or(0)).await;
    resp.respcode = status::OK;
}

async fn handle_teardown(ctx: &ReceiverContext, conn: &mut Connection, resp: &mut RtspMessage) {
    tracing::debug!("connection {}: TEARDOWN", conn.handle.number());
    if !have_player(ctx, conn, "TEARDOWN", resp) {
        return;
    }
    resp.respcode = status::OK;
    resp.headers.add("Connection", "close");
    if conn.player_running {
        ctx.player.stop().await;
        conn.player_running = false;
    }
}

fn handle_get_parameter(
    ctx: &ReceiverContext,
    conn: &mut Connection,
    req: &SharedMessage,
    resp: &mut RtspMessage,
) {
    tracing::debug!("connection {}: GET_PARAMETER", conn.handle.number());
    if !have_player(ctx, conn, "GET_PARAMETER", resp) {
        return;
    }

    if req.content.as_ref() == b"volume\r\n".as_slice() {
        let volume = *ctx
            .airplay_volume
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        resp.content = format!("\r\nvolume: {volume:.6}\r\n").into_bytes().into();
    }
    resp.respcode = status::OK;
}

async fn handle_set_parameter(
    ctx: &ReceiverContext,
    conn: &mut Connection,
    req: &SharedMessage,
    resp: &mut RtspMessage,
) {
    tracing::debug!("connection {}: SET_PARAMETER", conn.handle.number());
    if !have_player(ctx, conn, "SET_PARAMETER", resp) {
        return;
    }

    match req.headers.content_type() {
        Some(ct) if ct.starts_with("application/x-dmap-tagged") => {
            relay_dmap_metadata(ctx, req);
        }
        Some(ct) if ct.starts_with("image") => {
            relay_picture(ctx, req);
        }
        Some(ct) if ct.starts_with("text/parameters") => {
            apply_text_parameters(ctx, req).await;
        }
        Some(ct) => {
            tracing::debug!(
                "connection {}: received unknown Content-Type {ct:?} in SET_PARAMETER request",
                conn.handle.number()
            );
        }
        None => {
            tracing::debug!(
                "connection {}: missing Content-Type header in SET_PARAMETER request",
                conn.handle.number()
            );
        }
    }

    resp.respcode = status::OK;
}

/// rtptime from the request's RTP-Info header, if any.
fn request_rtptime(req: &SharedMessage) -> Option<u32> {
    req.headers
        .get("RTP-Info")
        .and_then(|v| header_field(v, "rtptime"))
        .and_then(|v| v.parse().ok())
}

/// Bracket a batch of DMAP tags with mdst/mden, forwarding each tag as
/// `core` metadata. The rtptime links items that belong to the same entity.
fn relay_dmap_metadata(ctx: &ReceiverContext, req: &SharedMessage) {
    let rtptime = req
        .headers
        .get("RTP-Info")
        .and_then(|v| header_field(v, "rtptime"));
    if rtptime.is_none() {
        tracing::debug!("missing RTP-Info rtptime for metadata");
    }

    publish_bracket(ctx, codes::METADATA_START, rtptime, req);
    for entry in dmap::entries(&req.content) {
        let code = u32::from_be_bytes(entry.tag);
        if entry.value.is_empty() {
            ctx.metadata.publish(codes::TYPE_CORE, code, &[], None);
        } else {
            ctx.metadata
                .publish(codes::TYPE_CORE, code, entry.value, Some(req));
        }
    }
    publish_bracket(ctx, codes::METADATA_END, rtptime, req);
}

/// Forward cover art as pcst / PICT / pcen.
fn relay_picture(ctx: &ReceiverContext, req: &SharedMessage) {
    if !ctx.config.metadata.include_cover_art {
        tracing::debug!("ignore received picture item (include_cover_art = no)");
        return;
    }
    let rtptime = req
        .headers
        .get("RTP-Info")
        .and_then(|v| header_field(v, "rtptime"));
    if rtptime.is_none() {
        tracing::debug!("missing RTP-Info rtptime for picture item");
    }

    publish_bracket(ctx, codes::PICTURE_START, rtptime, req);
    ctx.metadata
        .publish_ssnc(codes::PICTURE, &req.content, Some(req));
    publish_bracket(ctx, codes::PICTURE_END, rtptime, req);
}

fn publish_bracket(
    ctx: &ReceiverContext,
    code: u32,
    rtptime: Option<&str>,
    req: &SharedMessage,
) {
    match rtptime {
        Some(p) => ctx.metadata.publish_ssnc(code, p.as_bytes(), Some(req)),
        None => ctx.metadata.publish_ssnc(code, &[], None),
    }
}

/// Line-oriented `text/parameters` body: volume and progress.
async fn apply_text_parameters(ctx: &ReceiverContext, req: &SharedMessage) {
    let body = req.content_str();
    for line in tolerant_lines(&body) {
        if let Some(value) = line.strip_prefix("volume: ") {
            if let Ok(volume) = value.trim().parse::<f32>() {
                *ctx.airplay_volume
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = volume;
                ctx.player.set_volume(volume).await;
            } else {
                tracing::debug!("unparseable volume parameter: {value:?}");
            }
        } else if let Some(progress) = line.strip_prefix("progress: ") {
            ctx.metadata
                .publish_ssnc(codes::PROGRESS, progress.as_bytes(), None);
        } else {
            tracing::debug!("unrecognised parameter: {line:?}");
        }
    }
}
