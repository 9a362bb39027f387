//! MQTT client session orchestrator.
//!
//! Multiple threads may share one `Client`. Exactly one thread at a time
//! performs the physical transport read (the `recv` mutex is the
//! read-ownership lock); other threads encode and transmit their own
//! requests concurrently and wait on the pending-response registry for
//! their acknowledgments. A waiter that cannot get the read role parks on
//! the registry's condvar; whichever thread holds the role routes every
//! incoming packet to the node that asked for it.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use tinymq_core::packet::{
    decode_packet, decode_publish_header, encode_auth, encode_connect, encode_disconnect,
    encode_pingreq, encode_pub_resp, encode_publish, encode_subscribe, encode_unsubscribe, Auth,
    Connack, Connect, Disconnect, FixedHeader, Packet, PacketType, PubResp, Publish, QoS,
    Subscribe, Topic, Unsubscribe,
};
use tinymq_core::property::{PropertyList, PropertyType, PropertyValue};
use tinymq_core::ProtocolError;

use crate::callback::{IncomingMessage, MessageHandler};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::packet_id::PacketIdAllocator;
use crate::pending::{PendingHandle, PendingRegistry};
use crate::state::{MsgState, MsgStatus};
use crate::transport::Transport;

/// How long one read/write attempt may block before the waiting loop
/// re-checks its own node and its deadline.
const IO_SLICE: Duration = Duration::from_millis(100);

/// Callback answering a v5 AUTH challenge with the next AUTH packet.
pub type AuthHandler = Box<dyn FnMut(&Auth) -> Result<Auth> + Send>;

/// Receive-side state, guarded by the read-ownership lock. The accumulation
/// buffer and progress survive a timed-out read, so the next holder of the
/// role resumes mid-packet without replaying or losing bytes.
struct RecvState {
    buf: BytesMut,
    stat: MsgStatus,
    in_publish: Option<InboundPublish>,
}

/// A PUBLISH too large for the receive buffer, being delivered in chunks.
struct InboundPublish {
    msg: IncomingMessage,
    remaining: usize,
}

/// Send-side state. Bytes a timed-out write could not place stay queued and
/// are flushed before any later transmission.
struct SendState {
    queue: Vec<u8>,
    stat: MsgStatus,
}

struct SessionState {
    connected: bool,
    /// Negotiated keep-alive interval in seconds; the server may override
    /// the configured value in its CONNACK.
    keep_alive: u16,
    last_send: Instant,
}

/// Result of trying to frame a packet out of the receive buffer.
enum Framed {
    Packet(Packet),
    /// A PUBLISH whose payload exceeds the receive buffer; variable header
    /// decoded, payload to be streamed.
    BigPublish {
        publish: Publish,
        /// Fixed plus variable header bytes to discard from the buffer.
        skip: usize,
        payload_len: usize,
    },
    NeedMore,
}

/// MQTT client over a shared transport.
pub struct Client<T: Transport> {
    config: ClientConfig,
    transport: T,
    recv: Mutex<RecvState>,
    send: Mutex<SendState>,
    pending: PendingRegistry,
    packet_ids: Mutex<PacketIdAllocator>,
    handler: Mutex<Option<Box<dyn MessageHandler>>>,
    auth_handler: Mutex<Option<AuthHandler>>,
    session: Mutex<SessionState>,
}

impl<T: Transport> Client<T> {
    /// Create a client over an established transport.
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let buffer_size = config.read_buffer_size;
        Self {
            transport,
            recv: Mutex::new(RecvState {
                buf: BytesMut::with_capacity(buffer_size),
                stat: MsgStatus::new(),
                in_publish: None,
            }),
            send: Mutex::new(SendState {
                queue: Vec::with_capacity(buffer_size),
                stat: MsgStatus::new(),
            }),
            pending: PendingRegistry::new(),
            packet_ids: Mutex::new(PacketIdAllocator::new()),
            handler: Mutex::new(None),
            auth_handler: Mutex::new(None),
            session: Mutex::new(SessionState {
                connected: false,
                keep_alive: config.keep_alive,
                last_send: Instant::now(),
            }),
            config,
        }
    }

    /// Install the incoming-message handler.
    pub fn set_handler(&self, handler: Box<dyn MessageHandler>) {
        *self.handler.lock() = Some(handler);
    }

    /// Install the v5 AUTH challenge handler.
    pub fn set_auth_handler(&self, handler: AuthHandler) {
        *self.auth_handler.lock() = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().connected
    }

    /// Perform the CONNECT/CONNACK handshake.
    ///
    /// A v5 AUTH challenge arriving during the wait is answered through the
    /// handler installed with [`Client::set_auth_handler`]. The server's
    /// keep-alive override, if present, replaces the configured interval.
    pub fn connect(&self) -> Result<Connack> {
        if self.is_connected() {
            return Err(ClientError::Busy("already connected"));
        }

        let connect = Connect {
            protocol_version: self.config.protocol_version,
            clean_session: self.config.clean_session,
            keep_alive: self.config.keep_alive,
            client_id: self.config.client_id.clone(),
            will: self.config.will.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            properties: self.config.connect_properties.clone(),
        };
        let mut buf = Vec::new();
        encode_connect(&connect, &mut buf)?;

        let handle = self.pending.register(0, PacketType::Connack)?;
        if let Err(e) = self.transmit(&buf, self.config.connect_timeout) {
            self.pending.cancel(&handle);
            return Err(e);
        }
        let packet = self.wait_for(&handle, self.config.connect_timeout)?;
        let Packet::Connack(ack) = packet else {
            return Err(unexpected_ack());
        };
        if !ack.is_accepted() {
            return Err(ClientError::ConnectionRefused(ack.code));
        }

        let mut session = self.session.lock();
        session.connected = true;
        session.keep_alive = self.config.keep_alive;
        if let Some(props) = ack.properties.as_ref() {
            if let Some(PropertyValue::TwoByteInt(secs)) = props.first(PropertyType::ServerKeepAlive)
            {
                log::debug!("server keep-alive override: {}s", secs);
                session.keep_alive = *secs;
            }
        }
        drop(session);

        log::debug!("connected, session_present={}", ack.session_present);
        Ok(ack)
    }

    /// Publish a message. QoS 0 completes on write alone; QoS 1 awaits
    /// PUBACK; QoS 2 runs the PUBREC/PUBREL/PUBCOMP sequence.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        self.publish_message(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id: None,
            payload: Bytes::copy_from_slice(payload),
            properties: None,
        })
    }

    /// Publish a fully specified message. The packet id is allocated here
    /// for QoS > 0; any caller-provided id is ignored.
    pub fn publish_message(&self, mut publish: Publish) -> Result<()> {
        self.ensure_connected()?;
        let timeout = self.config.command_timeout;
        let version = self.version();

        match publish.qos {
            QoS::AtMostOnce => {
                publish.packet_id = None;
                let mut buf = Vec::new();
                encode_publish(&publish, version, &mut buf)?;
                self.transmit(&buf, timeout)
            }
            QoS::AtLeastOnce => {
                let id = self.allocate_packet_id()?;
                publish.packet_id = Some(id);
                let mut buf = Vec::new();
                encode_publish(&publish, version, &mut buf)?;
                let ack = self.request(id, PacketType::Puback, &buf, timeout)?;
                let Packet::Puback(resp) = ack else {
                    return Err(unexpected_ack());
                };
                check_resp_reason(&resp)
            }
            QoS::ExactlyOnce => {
                let id = self.allocate_packet_id()?;
                publish.packet_id = Some(id);
                let mut buf = Vec::new();
                encode_publish(&publish, version, &mut buf)?;
                let ack = self.request(id, PacketType::Pubrec, &buf, timeout)?;
                let Packet::Pubrec(resp) = ack else {
                    return Err(unexpected_ack());
                };
                check_resp_reason(&resp)?;

                // Release under the same id; the PUBCOMP node is registered
                // before PUBREL is transmitted.
                let mut rel_buf = Vec::new();
                encode_pub_resp(PacketType::Pubrel, &PubResp::new(id), version, &mut rel_buf)?;
                let ack = self.request(id, PacketType::Pubcomp, &rel_buf, timeout)?;
                let Packet::Pubcomp(resp) = ack else {
                    return Err(unexpected_ack());
                };
                check_resp_reason(&resp)
            }
        }
    }

    /// Subscribe to topics, returning one granted-QoS/reason code per
    /// requested topic, in request order.
    pub fn subscribe(&self, topics: &[(&str, QoS)]) -> Result<Vec<u8>> {
        let topics = topics
            .iter()
            .map(|(filter, qos)| Topic::new(*filter, *qos))
            .collect();
        self.subscribe_topics(topics, None)
    }

    /// Subscribe with full per-topic options and optional v5 properties.
    pub fn subscribe_topics(
        &self,
        topics: Vec<Topic>,
        properties: Option<PropertyList>,
    ) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let requested = topics.len();
        let id = self.allocate_packet_id()?;
        let subscribe = Subscribe {
            packet_id: id,
            topics,
            properties,
        };
        let mut buf = Vec::new();
        encode_subscribe(&subscribe, self.version(), &mut buf)?;

        let ack = self.request(id, PacketType::Suback, &buf, self.config.command_timeout)?;
        let Packet::Suback(suback) = ack else {
            return Err(unexpected_ack());
        };
        // The code-to-topic correspondence is positional and implicit
        if suback.return_codes.len() != requested {
            return Err(ProtocolError::ProtocolViolation(format!(
                "SUBACK carried {} return codes for {} topics",
                suback.return_codes.len(),
                requested
            ))
            .into());
        }
        Ok(suback.return_codes)
    }

    /// Unsubscribe from topics. Returns the v5 per-topic reason codes;
    /// empty under 3.1.1.
    pub fn unsubscribe(&self, topics: &[&str]) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let id = self.allocate_packet_id()?;
        let unsubscribe = Unsubscribe {
            packet_id: id,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            properties: None,
        };
        let mut buf = Vec::new();
        encode_unsubscribe(&unsubscribe, self.version(), &mut buf)?;

        let ack = self.request(id, PacketType::Unsuback, &buf, self.config.command_timeout)?;
        let Packet::Unsuback(unsuback) = ack else {
            return Err(unexpected_ack());
        };
        Ok(unsuback.reason_codes)
    }

    /// Send a PINGREQ and await the PINGRESP.
    pub fn ping(&self) -> Result<()> {
        self.ensure_connected()?;
        let handle = self.pending.register(0, PacketType::Pingresp)?;
        let mut buf = Vec::new();
        encode_pingreq(&mut buf);
        if let Err(e) = self.transmit(&buf, self.config.command_timeout) {
            self.pending.cancel(&handle);
            return Err(e);
        }
        self.wait_for(&handle, self.config.command_timeout)?;
        Ok(())
    }

    /// Proactively ping once three quarters of the negotiated keep-alive
    /// interval has elapsed since the last transmission.
    ///
    /// A missing PINGRESP is fatal to the session and is never retried.
    pub fn keep_alive(&self) -> Result<()> {
        let due = {
            let session = self.session.lock();
            if !session.connected {
                return Err(ClientError::NotConnected);
            }
            if session.keep_alive == 0 {
                return Ok(());
            }
            let interval = Duration::from_secs(session.keep_alive as u64);
            session.last_send.elapsed() >= interval * 3 / 4
        };
        if !due {
            return Ok(());
        }

        match self.ping() {
            Ok(()) => Ok(()),
            Err(ClientError::Timeout) => {
                log::warn!("keep-alive ping went unanswered, session is dead");
                self.session.lock().connected = false;
                Err(ClientError::KeepAliveTimeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Send DISCONNECT and tear the transport down.
    pub fn disconnect(&self, reason_code: u8) -> Result<()> {
        let disconnect = Disconnect {
            reason_code,
            properties: None,
        };
        let mut buf = Vec::new();
        encode_disconnect(&disconnect, self.version(), &mut buf)?;
        // Best effort: the session is going down either way
        let _ = self.transmit(&buf, self.config.command_timeout);
        self.session.lock().connected = false;
        self.transport.disconnect()
    }

    /// Run a v5 re-authentication exchange.
    pub fn auth(&self, auth: Auth) -> Result<Auth> {
        if self.version() != 5 {
            return Err(ProtocolError::BadArg("AUTH requires protocol version 5").into());
        }
        self.ensure_connected()?;
        let mut buf = Vec::new();
        encode_auth(&auth, self.version(), &mut buf)?;
        let handle = self.pending.register(0, PacketType::Auth)?;
        if let Err(e) = self.transmit(&buf, self.config.command_timeout) {
            self.pending.cancel(&handle);
            return Err(e);
        }
        let packet = self.wait_for(&handle, self.config.command_timeout)?;
        let Packet::Auth(resp) = packet else {
            return Err(unexpected_ack());
        };
        Ok(resp)
    }

    /// Take the read role and process one incoming packet, delivering any
    /// PUBLISH to the handler. Returns `Timeout` if no packet completed
    /// within `timeout`; partial progress is kept for the next call.
    pub fn poll_message(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let Some(mut recv) = self.recv.try_lock_for(timeout) else {
            return Err(ClientError::Timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = self.read_and_route(&mut recv, remaining);
        drop(recv);
        if result.is_ok() {
            self.pending.notify_waiters();
        }
        result
    }

    // === Internal machinery ===

    fn version(&self) -> u8 {
        self.config.protocol_version
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    fn allocate_packet_id(&self) -> Result<u16> {
        let mut ids = self.packet_ids.lock();
        ids.allocate(|id| self.pending.contains_id(id))
    }

    /// Register, transmit, await: the common shape of every acknowledged
    /// request. The node is linked before the first byte goes out.
    fn request(
        &self,
        packet_id: u16,
        expect: PacketType,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<Packet> {
        let handle = self.pending.register(packet_id, expect)?;
        if let Err(e) = self.transmit(bytes, timeout) {
            self.pending.cancel(&handle);
            return Err(e);
        }
        self.wait_for(&handle, timeout)
    }

    /// Wait for this node's acknowledgment, draining the socket whenever no
    /// other thread holds the read role.
    ///
    /// On timeout the node is unlinked; its late ack, if any, will be
    /// discarded by whichever thread reads it.
    fn wait_for(&self, handle: &PendingHandle, timeout: Duration) -> Result<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(packet) = self.pending.try_take(handle) {
                return Ok(packet);
            }
            let now = Instant::now();
            if now >= deadline {
                self.pending.cancel(handle);
                return Err(ClientError::Timeout);
            }
            let slice = (deadline - now).min(IO_SLICE);

            if let Some(mut recv) = self.recv.try_lock() {
                match self.read_and_route(&mut recv, slice) {
                    Ok(()) => {
                        drop(recv);
                        self.pending.notify_waiters();
                    }
                    // Nothing (or only part of a packet) arrived; state is
                    // kept for whoever reads next
                    Err(ClientError::Timeout) => {}
                    Err(e) => {
                        drop(recv);
                        self.pending.cancel(handle);
                        return Err(e);
                    }
                }
            } else if let Some(packet) = self.pending.wait_done(handle, slice) {
                return Ok(packet);
            }
        }
    }

    /// Read until one packet is framed and routed, or the deadline passes.
    ///
    /// A wire-format violation aborts only the current read exchange: the
    /// receive state is reset and the error goes to the thread holding the
    /// read role; registry nodes are untouched.
    fn read_and_route(&self, recv: &mut RecvState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        if recv.in_publish.is_some() {
            return self.continue_publish_delivery(recv, deadline);
        }

        loop {
            match self.try_frame(recv) {
                Ok(Framed::Packet(packet)) => {
                    if matches!(packet, Packet::Auth(_)) {
                        recv.stat.advance_read(MsgState::Auth);
                    } else {
                        recv.stat.advance_read(MsgState::Header);
                    }
                    let result = self.route_packet(packet);
                    recv.stat.reset();
                    return result;
                }
                Ok(Framed::BigPublish {
                    publish,
                    skip,
                    payload_len,
                }) => {
                    return self.begin_publish_delivery(recv, publish, skip, payload_len, deadline)
                }
                Ok(Framed::NeedMore) => {}
                Err(e) => {
                    recv.buf.clear();
                    recv.in_publish = None;
                    recv.stat.reset();
                    return Err(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            self.read_some(recv, deadline - now)?;
        }
    }

    /// Try to frame a packet out of the buffered bytes.
    fn try_frame(&self, recv: &mut RecvState) -> Result<Framed> {
        if !recv.buf.is_empty() && recv.stat.read == MsgState::Begin {
            recv.stat.advance_read(MsgState::Wait);
        }

        let Some((header, header_len)) = FixedHeader::decode(&recv.buf)? else {
            return Ok(Framed::NeedMore);
        };
        let total = header_len + header.remaining_len;

        if total <= recv.buf.len() {
            let Some((packet, consumed)) = decode_packet(&recv.buf, self.version())? else {
                return Ok(Framed::NeedMore);
            };
            let _ = recv.buf.split_to(consumed);
            return Ok(Framed::Packet(packet));
        }

        if total > self.config.read_buffer_size {
            if header.packet_type == PacketType::Publish {
                // Stream the payload instead of buffering the whole packet
                if let Some((publish, var_len)) = decode_publish_header(
                    header.flags,
                    &recv.buf[header_len..],
                    header.remaining_len,
                    self.version(),
                )? {
                    return Ok(Framed::BigPublish {
                        publish,
                        skip: header_len + var_len,
                        payload_len: header.remaining_len - var_len,
                    });
                }
                return Ok(Framed::NeedMore);
            }
            return Err(ClientError::PacketTooLarge {
                size: total,
                max: self.config.read_buffer_size,
            });
        }

        Ok(Framed::NeedMore)
    }

    fn begin_publish_delivery(
        &self,
        recv: &mut RecvState,
        publish: Publish,
        skip: usize,
        payload_len: usize,
        deadline: Instant,
    ) -> Result<()> {
        let _ = recv.buf.split_to(skip);
        recv.stat.advance_read(MsgState::Header);

        let msg = IncomingMessage {
            topic: publish.topic,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            properties: publish.properties,
            total_payload_len: payload_len,
            received_len: 0,
        };
        if let Some(handler) = self.handler.lock().as_mut() {
            handler.on_message_begin(&msg);
        }
        recv.in_publish = Some(InboundPublish {
            msg,
            remaining: payload_len,
        });
        recv.stat.advance_read(MsgState::Payload);

        self.continue_publish_delivery(recv, deadline)
    }

    /// Deliver buffered payload chunks, reading more until the message
    /// completes or the deadline passes. A timeout leaves the continuation
    /// state in place for the next holder of the read role.
    fn continue_publish_delivery(&self, recv: &mut RecvState, deadline: Instant) -> Result<()> {
        loop {
            {
                let RecvState {
                    buf, in_publish, ..
                } = recv;
                let Some(state) = in_publish.as_mut() else {
                    return Ok(());
                };
                while state.remaining > 0 && !buf.is_empty() {
                    let take = buf
                        .len()
                        .min(state.remaining)
                        .min(self.config.read_buffer_size);
                    let chunk = buf.split_to(take);
                    state.msg.received_len += take;
                    state.remaining -= take;
                    if let Some(handler) = self.handler.lock().as_mut() {
                        handler.on_payload(&state.msg, &chunk);
                    }
                }
            }

            if recv.in_publish.as_ref().is_some_and(|s| s.remaining == 0) {
                let state = recv.in_publish.take().unwrap();
                if let Some(handler) = self.handler.lock().as_mut() {
                    handler.on_message_end(&state.msg);
                }
                self.ack_publish(state.msg.qos, state.msg.packet_id)?;
                recv.stat.reset();
                return Ok(());
            }

            if recv.stat.read < MsgState::Payload2 {
                recv.stat.advance_read(MsgState::Payload2);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            self.read_some(recv, deadline - now)?;
        }
    }

    /// Pull more bytes off the transport into the receive buffer.
    fn read_some(&self, recv: &mut RecvState, timeout: Duration) -> Result<()> {
        let mut tmp = [0u8; 4096];
        let want = tmp.len().min(self.config.read_buffer_size.max(16));
        let n = self.transport.read(&mut tmp[..want], timeout.min(IO_SLICE))?;
        recv.buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }

    /// Route one complete incoming packet.
    fn route_packet(&self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.deliver_publish(publish),

            // Inbound QoS 2 release for a PUBLISH we acknowledged earlier
            Packet::Pubrel(resp) => {
                let mut buf = Vec::new();
                encode_pub_resp(
                    PacketType::Pubcomp,
                    &PubResp::new(resp.packet_id),
                    self.version(),
                    &mut buf,
                )?;
                self.transmit(&buf, self.config.command_timeout)
            }

            Packet::Disconnect(disconnect) => {
                log::warn!(
                    "server closed the session, reason {:#04x}",
                    disconnect.reason_code
                );
                self.session.lock().connected = false;
                if let Some(handler) = self.handler.lock().as_mut() {
                    handler.on_disconnect(disconnect.reason_code);
                }
                Err(ClientError::ConnectionClosed)
            }

            Packet::Auth(auth) => self.route_auth(auth),

            ack @ (Packet::Connack(_)
            | Packet::Puback(_)
            | Packet::Pubrec(_)
            | Packet::Pubcomp(_)
            | Packet::Suback(_)
            | Packet::Unsuback(_)
            | Packet::Pingresp) => {
                let ptype = ack.packet_type();
                let id = ack.packet_id().unwrap_or(0);
                match self.pending.complete(ptype, id, ack) {
                    Ok(()) => Ok(()),
                    // Late ack for a timed-out or completed exchange:
                    // drained and discarded
                    Err(ClientError::NoMatchingRequest) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            other => Err(ProtocolError::ProtocolViolation(format!(
                "unexpected {} from server",
                other.packet_type().name()
            ))
            .into()),
        }
    }

    /// An AUTH packet either answers an explicit re-authentication request
    /// or is a server challenge to be answered through the auth handler.
    fn route_auth(&self, auth: Auth) -> Result<()> {
        match self
            .pending
            .complete(PacketType::Auth, 0, Packet::Auth(auth.clone()))
        {
            Ok(()) => Ok(()),
            Err(ClientError::NoMatchingRequest) => {
                let mut guard = self.auth_handler.lock();
                let Some(handler) = guard.as_mut() else {
                    return Err(ProtocolError::ProtocolViolation(
                        "AUTH challenge with no authentication handler".into(),
                    )
                    .into());
                };
                let response = handler(&auth)?;
                drop(guard);
                let mut buf = Vec::new();
                encode_auth(&response, self.version(), &mut buf)?;
                self.transmit(&buf, self.config.command_timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Deliver a fully buffered PUBLISH and acknowledge it per its QoS.
    fn deliver_publish(&self, publish: Publish) -> Result<()> {
        let total = publish.payload.len();
        let mut msg = IncomingMessage {
            topic: publish.topic,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            properties: publish.properties,
            total_payload_len: total,
            received_len: 0,
        };
        if let Some(handler) = self.handler.lock().as_mut() {
            handler.on_message_begin(&msg);
            if !publish.payload.is_empty() {
                msg.received_len = total;
                handler.on_payload(&msg, &publish.payload);
            }
            handler.on_message_end(&msg);
        }
        self.ack_publish(msg.qos, msg.packet_id)
    }

    /// Acknowledge an inbound PUBLISH: PUBACK for QoS 1, PUBREC for QoS 2.
    fn ack_publish(&self, qos: QoS, packet_id: Option<u16>) -> Result<()> {
        let (ptype, id) = match (qos, packet_id) {
            (QoS::AtLeastOnce, Some(id)) => (PacketType::Puback, id),
            (QoS::ExactlyOnce, Some(id)) => (PacketType::Pubrec, id),
            _ => return Ok(()),
        };
        let mut buf = Vec::new();
        encode_pub_resp(ptype, &PubResp::new(id), self.version(), &mut buf)?;
        self.transmit(&buf, self.config.command_timeout)
    }

    /// Queue bytes and flush the send backlog.
    ///
    /// A timed-out flush keeps its position; the unsent tail goes out ahead
    /// of whatever is transmitted next, so nothing is replayed or lost.
    fn transmit(&self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut send = self.send.lock();
        send.stat.start_write()?;
        send.queue.extend_from_slice(bytes);
        if send.stat.write < MsgState::Header {
            send.stat.advance_write(MsgState::Header);
        }

        let result = loop {
            if send.queue.is_empty() {
                break Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(ClientError::Timeout);
            }
            match self
                .transport
                .write(&send.queue, (deadline - now).min(IO_SLICE))
            {
                Ok(n) => {
                    send.queue.drain(..n);
                    if !send.queue.is_empty() && send.stat.write < MsgState::Payload {
                        send.stat.advance_write(MsgState::Payload);
                    }
                }
                Err(ClientError::Timeout) => {}
                Err(e) => {
                    send.stat.finish_write();
                    return Err(e);
                }
            }
        };

        send.stat.finish_write();
        if result.is_ok() {
            send.stat.reset();
            self.session.lock().last_send = Instant::now();
        }
        result
    }
}

fn unexpected_ack() -> ClientError {
    ProtocolError::ProtocolViolation("acknowledgment type mismatch".into()).into()
}

fn check_resp_reason(resp: &PubResp) -> Result<()> {
    if resp.reason_code >= 0x80 {
        return Err(ClientError::Rejected(resp.reason_code));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Condvar;
    use tinymq_core::packet::{encode_packet, Suback};

    /// In-memory transport scripted by the test: the test pushes the bytes
    /// the "server" sends and inspects everything the client wrote.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        inner: Arc<Pipe>,
    }

    #[derive(Default)]
    struct Pipe {
        inbound: Mutex<Vec<u8>>,
        outbound: Mutex<Vec<u8>>,
        signal: Condvar,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self::default()
        }

        fn push(&self, bytes: &[u8]) {
            let mut inbound = self.inner.inbound.lock();
            inbound.extend_from_slice(bytes);
            self.inner.signal.notify_all();
        }

        fn push_packet(&self, packet: &Packet, version: u8) {
            let mut buf = Vec::new();
            encode_packet(packet, version, &mut buf).unwrap();
            self.push(&buf);
        }

        fn outbound_packets(&self, version: u8) -> Vec<Packet> {
            let buf = self.inner.outbound.lock().clone();
            let mut packets = Vec::new();
            let mut pos = 0;
            while let Some((packet, consumed)) = decode_packet(&buf[pos..], version).unwrap() {
                packets.push(packet);
                pos += consumed;
            }
            packets
        }
    }

    impl Transport for ScriptedTransport {
        fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            let deadline = Instant::now() + timeout;
            let mut inbound = self.inner.inbound.lock();
            while inbound.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ClientError::Timeout);
                }
                self.inner.signal.wait_for(&mut inbound, deadline - now);
            }
            let n = buf.len().min(inbound.len());
            buf[..n].copy_from_slice(&inbound[..n]);
            inbound.drain(..n);
            Ok(n)
        }

        fn write(&self, buf: &[u8], _timeout: Duration) -> Result<usize> {
            let mut outbound = self.inner.outbound.lock();
            outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn connack_ok() -> Packet {
        Packet::Connack(Connack {
            session_present: false,
            code: 0,
            properties: None,
        })
    }

    fn connected(config: ClientConfig) -> (Client<ScriptedTransport>, ScriptedTransport) {
        let version = config.protocol_version;
        let transport = ScriptedTransport::new();
        let client = Client::new(transport.clone(), config);
        transport.push_packet(&connack_ok(), version);
        client.connect().unwrap();
        (client, transport)
    }

    #[derive(Default)]
    struct Recorder {
        begun: usize,
        ended: usize,
        chunks: Vec<usize>,
        payload: Vec<u8>,
        topic: String,
        disconnects: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct SharedRecorder(Arc<Mutex<Recorder>>);

    impl MessageHandler for SharedRecorder {
        fn on_message_begin(&mut self, msg: &IncomingMessage) {
            let mut r = self.0.lock();
            r.begun += 1;
            r.topic = msg.topic.clone();
        }

        fn on_payload(&mut self, _msg: &IncomingMessage, chunk: &[u8]) {
            let mut r = self.0.lock();
            r.chunks.push(chunk.len());
            r.payload.extend_from_slice(chunk);
        }

        fn on_message_end(&mut self, _msg: &IncomingMessage) {
            self.0.lock().ended += 1;
        }

        fn on_disconnect(&mut self, reason_code: u8) {
            self.0.lock().disconnects.push(reason_code);
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::new("test-client")
            .connect_timeout(Duration::from_secs(2))
            .command_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_connect_handshake() {
        let (client, transport) = connected(fast_config());
        assert!(client.is_connected());

        let sent = transport.outbound_packets(4);
        assert_eq!(sent.len(), 1);
        let Packet::Connect(connect) = &sent[0] else {
            panic!("expected CONNECT first");
        };
        assert_eq!(connect.client_id, "test-client");
        assert_eq!(connect.protocol_version, 4);
    }

    #[test]
    fn test_connect_refused() {
        let transport = ScriptedTransport::new();
        let client = Client::new(transport.clone(), fast_config());
        transport.push_packet(
            &Packet::Connack(Connack {
                session_present: false,
                code: 5,
                properties: None,
            }),
            4,
        );
        assert!(matches!(
            client.connect(),
            Err(ClientError::ConnectionRefused(5))
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_server_keep_alive_override() {
        let mut props = PropertyList::new();
        props
            .push(PropertyType::ServerKeepAlive, PropertyValue::TwoByteInt(7))
            .unwrap();
        let transport = ScriptedTransport::new();
        let client = Client::new(transport.clone(), fast_config().mqtt5().keep_alive(300));
        transport.push_packet(
            &Packet::Connack(Connack {
                session_present: false,
                code: 0,
                properties: Some(props),
            }),
            5,
        );
        client.connect().unwrap();
        assert_eq!(client.session.lock().keep_alive, 7);
    }

    #[test]
    fn test_qos0_publish_completes_on_write() {
        let (client, transport) = connected(fast_config());
        client
            .publish("t/qos0", b"data", QoS::AtMostOnce, false)
            .unwrap();

        let sent = transport.outbound_packets(4);
        let Packet::Publish(publish) = &sent[1] else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.packet_id, None);
        assert_eq!(&publish.payload[..], b"data");
    }

    #[test]
    fn test_qos1_publish_awaits_puback() {
        let (client, transport) = connected(fast_config());
        transport.push_packet(&Packet::Puback(PubResp::new(1)), 4);

        client
            .publish("t/qos1", b"data", QoS::AtLeastOnce, false)
            .unwrap();
        assert!(!client.pending.contains_id(1));

        let sent = transport.outbound_packets(4);
        let Packet::Publish(publish) = &sent[1] else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.packet_id, Some(1));
    }

    #[test]
    fn test_qos1_rejected_reason_code() {
        let (client, transport) = connected(fast_config().mqtt5());
        transport.push_packet(
            &Packet::Puback(PubResp {
                packet_id: 1,
                reason_code: 0x87, // not authorized
                properties: None,
            }),
            5,
        );
        assert!(matches!(
            client.publish("t", b"x", QoS::AtLeastOnce, false),
            Err(ClientError::Rejected(0x87))
        ));
    }

    #[test]
    fn test_qos2_flow_and_stale_pubrec_discarded() {
        let (client, transport) = connected(fast_config());
        transport.push_packet(&Packet::Pubrec(PubResp::new(1)), 4);
        transport.push_packet(&Packet::Pubcomp(PubResp::new(1)), 4);

        client
            .publish("t/qos2", b"data", QoS::ExactlyOnce, false)
            .unwrap();
        assert!(!client.pending.contains_id(1));

        let sent = transport.outbound_packets(4);
        assert!(matches!(&sent[1], Packet::Publish(p) if p.packet_id == Some(1)));
        assert!(matches!(&sent[2], Packet::Pubrel(r) if r.packet_id == 1));

        // A duplicate PUBREC after completion matches nothing and must not
        // disturb the next exchange
        transport.push_packet(&Packet::Pubrec(PubResp::new(1)), 4);
        transport.push_packet(&Packet::Pingresp, 4);
        client.ping().unwrap();
        assert!(!client.pending.contains_id(1));
    }

    #[test]
    fn test_subscribe_codes_in_request_order() {
        let (client, transport) = connected(fast_config());
        transport.push_packet(
            &Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![1, 2],
                properties: None,
            }),
            4,
        );

        let codes = client
            .subscribe(&[("a/#", QoS::AtLeastOnce), ("b", QoS::ExactlyOnce)])
            .unwrap();
        assert_eq!(codes, vec![1, 2]);
    }

    #[test]
    fn test_suback_code_count_mismatch() {
        let (client, transport) = connected(fast_config());
        transport.push_packet(
            &Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![0],
                properties: None,
            }),
            4,
        );

        let result = client.subscribe(&[("a", QoS::AtMostOnce), ("b", QoS::AtMostOnce)]);
        assert!(matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::ProtocolViolation(_)))
        ));
    }

    #[test]
    fn test_concurrent_subscribes_interleaved_responses() {
        let (client, transport) = connected(fast_config());

        std::thread::scope(|scope| {
            let alpha = scope.spawn(|| client.subscribe(&[("alpha", QoS::AtLeastOnce)]));
            let beta = scope.spawn(|| client.subscribe(&[("beta", QoS::ExactlyOnce)]));

            // Wait until both SUBSCRIBE packets are on the wire
            let (alpha_id, beta_id) = loop {
                let sent = transport.outbound_packets(4);
                let subs: Vec<&Subscribe> = sent
                    .iter()
                    .filter_map(|p| match p {
                        Packet::Subscribe(s) => Some(s),
                        _ => None,
                    })
                    .collect();
                if subs.len() == 2 {
                    let find = |topic: &str| {
                        subs.iter()
                            .find(|s| s.topics[0].filter == topic)
                            .unwrap()
                            .packet_id
                    };
                    break (find("alpha"), find("beta"));
                }
                std::thread::sleep(Duration::from_millis(5));
            };
            assert_ne!(alpha_id, beta_id);

            // Answer in reverse order so the responses interleave
            transport.push_packet(
                &Packet::Suback(Suback {
                    packet_id: beta_id,
                    return_codes: vec![2],
                    properties: None,
                }),
                4,
            );
            transport.push_packet(
                &Packet::Suback(Suback {
                    packet_id: alpha_id,
                    return_codes: vec![1],
                    properties: None,
                }),
                4,
            );

            assert_eq!(alpha.join().unwrap().unwrap(), vec![1]);
            assert_eq!(beta.join().unwrap().unwrap(), vec![2]);
        });
    }

    #[test]
    fn test_timeout_unlinks_and_late_ack_is_discarded() {
        let (client, transport) =
            connected(fast_config().command_timeout(Duration::from_millis(60)));

        // No SUBACK arrives: the wait times out and unlinks its node
        assert!(matches!(
            client.subscribe(&[("slow", QoS::AtMostOnce)]),
            Err(ClientError::Timeout)
        ));
        assert!(!client.pending.contains_id(1));

        // The late SUBACK drains through the NOT_FOUND path without
        // disturbing the unrelated ping that follows it
        transport.push_packet(
            &Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![0],
                properties: None,
            }),
            4,
        );
        transport.push_packet(&Packet::Pingresp, 4);
        client.ping().unwrap();

        // And a later request keeps working
        transport.push_packet(
            &Packet::Suback(Suback {
                packet_id: 2,
                return_codes: vec![0],
                properties: None,
            }),
            4,
        );
        assert_eq!(client.subscribe(&[("ok", QoS::AtMostOnce)]).unwrap(), vec![0]);
    }

    #[test]
    fn test_small_publish_delivered_whole() {
        let (client, transport) = connected(fast_config());
        let recorder = SharedRecorder::default();
        client.set_handler(Box::new(recorder.clone()));

        transport.push_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "news".into(),
                packet_id: None,
                payload: Bytes::from_static(b"hello"),
                properties: None,
            }),
            4,
        );
        client.poll_message(Duration::from_secs(1)).unwrap();

        let r = recorder.0.lock();
        assert_eq!(r.begun, 1);
        assert_eq!(r.ended, 1);
        assert_eq!(r.topic, "news");
        assert_eq!(r.payload, b"hello");
        assert_eq!(r.chunks.len(), 1);
    }

    #[test]
    fn test_oversized_publish_delivered_in_chunks() {
        let (client, transport) = connected(fast_config().read_buffer_size(64));
        let recorder = SharedRecorder::default();
        client.set_handler(Box::new(recorder.clone()));

        let payload: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        transport.push_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "bulk/data".into(),
                packet_id: None,
                payload: Bytes::from(payload.clone()),
                properties: None,
            }),
            4,
        );
        client.poll_message(Duration::from_secs(1)).unwrap();

        let r = recorder.0.lock();
        assert_eq!(r.begun, 1);
        assert_eq!(r.ended, 1);
        assert!(r.chunks.len() > 1, "payload should arrive in chunks");
        assert_eq!(r.payload, payload);
    }

    #[test]
    fn test_inbound_qos2_acknowledgment_sequence() {
        let (client, transport) = connected(fast_config());
        let recorder = SharedRecorder::default();
        client.set_handler(Box::new(recorder.clone()));

        transport.push_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::ExactlyOnce,
                retain: false,
                topic: "exact".into(),
                packet_id: Some(9),
                payload: Bytes::from_static(b"x"),
                properties: None,
            }),
            4,
        );
        client.poll_message(Duration::from_secs(1)).unwrap();

        transport.push_packet(&Packet::Pubrel(PubResp::new(9)), 4);
        client.poll_message(Duration::from_secs(1)).unwrap();

        let sent = transport.outbound_packets(4);
        assert!(sent.iter().any(|p| matches!(p, Packet::Pubrec(r) if r.packet_id == 9)));
        assert!(sent.iter().any(|p| matches!(p, Packet::Pubcomp(r) if r.packet_id == 9)));
        assert_eq!(recorder.0.lock().ended, 1);
    }

    #[test]
    fn test_server_disconnect_notifies_handler() {
        let (client, transport) = connected(fast_config());
        let recorder = SharedRecorder::default();
        client.set_handler(Box::new(recorder.clone()));

        transport.push_packet(&Packet::Disconnect(Disconnect::default()), 4);
        assert!(matches!(
            client.poll_message(Duration::from_secs(1)),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(!client.is_connected());
        assert_eq!(recorder.0.lock().disconnects, vec![0]);
    }

    #[test]
    fn test_keep_alive_pings_when_due() {
        let (client, transport) = connected(fast_config().keep_alive(1));
        transport.push_packet(&Packet::Pingresp, 4);

        // Not yet due
        client.keep_alive().unwrap();
        assert!(transport
            .outbound_packets(4)
            .iter()
            .all(|p| !matches!(p, Packet::Pingreq)));

        std::thread::sleep(Duration::from_millis(800));
        client.keep_alive().unwrap();

        let pings = transport
            .outbound_packets(4)
            .iter()
            .filter(|p| matches!(p, Packet::Pingreq))
            .count();
        assert_eq!(pings, 1);

        // The ping refreshed the idle clock
        client.keep_alive().unwrap();
        let pings = transport
            .outbound_packets(4)
            .iter()
            .filter(|p| matches!(p, Packet::Pingreq))
            .count();
        assert_eq!(pings, 1);
    }

    #[test]
    fn test_keep_alive_timeout_is_fatal() {
        let (client, _transport) = connected(
            fast_config()
                .keep_alive(1)
                .command_timeout(Duration::from_millis(60)),
        );

        std::thread::sleep(Duration::from_millis(800));
        assert!(matches!(
            client.keep_alive(),
            Err(ClientError::KeepAliveTimeout)
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_auth_challenge_during_connect() {
        use tinymq_core::packet::reason_code;

        let transport = ScriptedTransport::new();
        let client = Client::new(transport.clone(), fast_config().mqtt5());
        client.set_auth_handler(Box::new(|challenge: &Auth| {
            assert_eq!(challenge.reason_code, reason_code::CONTINUE_AUTHENTICATION);
            Ok(Auth {
                reason_code: reason_code::CONTINUE_AUTHENTICATION,
                properties: None,
            })
        }));

        transport.push_packet(
            &Packet::Auth(Auth {
                reason_code: reason_code::CONTINUE_AUTHENTICATION,
                properties: None,
            }),
            5,
        );
        transport.push_packet(&connack_ok(), 5);
        client.connect().unwrap();

        // The challenge answer went out between CONNECT and the handshake
        // completing
        let sent = transport.outbound_packets(5);
        assert!(matches!(&sent[0], Packet::Connect(_)));
        assert!(sent
            .iter()
            .any(|p| matches!(p, Packet::Auth(a) if a.reason_code == reason_code::CONTINUE_AUTHENTICATION)));
    }

    #[test]
    fn test_reauthentication_exchange() {
        use tinymq_core::packet::reason_code;

        let (client, transport) = connected(fast_config().mqtt5());
        transport.push_packet(
            &Packet::Auth(Auth {
                reason_code: reason_code::SUCCESS,
                properties: None,
            }),
            5,
        );

        let response = client
            .auth(Auth {
                reason_code: reason_code::RE_AUTHENTICATE,
                properties: None,
            })
            .unwrap();
        assert_eq!(response.reason_code, reason_code::SUCCESS);
    }

    #[test]
    fn test_operations_require_connection() {
        let client = Client::new(ScriptedTransport::new(), fast_config());
        assert!(matches!(
            client.publish("t", b"x", QoS::AtMostOnce, false),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe(&[("t", QoS::AtMostOnce)]),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(client.ping(), Err(ClientError::NotConnected)));
    }
}
