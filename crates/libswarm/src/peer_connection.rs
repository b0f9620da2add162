// One peer's wire loop: handshake exchange, then a reader half
// dispatching decoded messages into the handler and a writer half
// draining the connection's outgoing queue, with keep-alives on idle.

use std::net::SocketAddr;
use std::time::Duration;

use bencode::ByteBufOwned;
use peer_wire::extended::handshake::ExtendedHandshake;
use peer_wire::extended::{ExtendedMessage, PeerExtendedMessageIds};
use peer_wire::{
    serialize_piece_preamble, Handshake, MessageBorrowed, MessageOwned, PIECE_MESSAGE_DEFAULT_LEN,
};
use swarm_core::hash_id::Id20;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};

#[derive(Debug)]
pub enum WriterRequest {
    Message(MessageOwned),
    /// A block read from storage for the peer, to be emitted as PIECE
    /// unless it was cancelled in the meantime.
    Block(crate::connection_state::BlockRead),
    Disconnect,
}

pub type PeerRx = tokio::sync::mpsc::UnboundedReceiver<WriterRequest>;
pub type PeerTx = tokio::sync::mpsc::UnboundedSender<WriterRequest>;

#[derive(Debug, Clone, Copy)]
pub struct PeerConnectionOptions {
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for PeerConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(120),
        }
    }
}

pub trait PeerConnectionHandler {
    /// The peer's plain handshake was read and its info hash checked.
    fn on_handshake(&self, handshake: &Handshake) -> Result<()>;
    fn on_received_message(&self, msg: MessageBorrowed<'_>) -> anyhow::Result<()>;
    /// Our bitfield message, if there is anything to advertise.
    fn serialize_bitfield_message_to_buf(&self, buf: &mut Vec<u8>) -> anyhow::Result<Option<usize>>;
    /// Our extended handshake; None when the peer didn't advertise
    /// extended messaging.
    fn extended_handshake(&self) -> Option<ExtendedHandshake<ByteBufOwned>>;
    fn peer_extended_msg_ids(&self) -> PeerExtendedMessageIds;
    /// Last gate before a queued block goes on the wire; false drops
    /// it (the peer cancelled).
    fn should_send_block(&self, block: &crate::connection_state::BlockRead) -> bool;
    fn on_uploaded_bytes(&self, bytes: u32);
}

pub struct PeerConnection<H> {
    handler: H,
    addr: SocketAddr,
    info_hash: Id20,
    peer_id: Id20,
    options: PeerConnectionOptions,
}

impl<H: PeerConnectionHandler> PeerConnection<H> {
    pub fn new(
        addr: SocketAddr,
        info_hash: Id20,
        peer_id: Id20,
        handler: H,
        options: PeerConnectionOptions,
    ) -> Self {
        Self {
            handler,
            addr,
            info_hash,
            peer_id,
            options,
        }
    }

    pub async fn manage_peer_outgoing(&self, rx: PeerRx) -> Result<()> {
        let mut conn = timeout(self.options.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                Error::Connect(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(Error::Connect)?;

        let mut buf = Vec::with_capacity(128);
        Handshake::new(self.info_hash, self.peer_id).serialize(&mut buf);
        conn.write_all(&buf).await.map_err(Error::WriteHandshake)?;

        let mut read_buf = vec![0u8; PIECE_MESSAGE_DEFAULT_LEN * 2];
        let mut read_so_far = 0usize;
        let (handshake, consumed) = loop {
            match Handshake::deserialize(&read_buf[..read_so_far]) {
                Ok(h) => break h,
                Err(e) if e.is_not_enough_data() => {}
                Err(e) => return Err(e.into()),
            }
            let size = conn
                .read(&mut read_buf[read_so_far..])
                .await
                .map_err(Error::ReadHandshake)?;
            if size == 0 {
                return Err(Error::PeerDisconnectedReadingHandshake);
            }
            read_so_far += size;
        };
        if handshake.info_hash != self.info_hash {
            return Err(Error::WrongInfoHash);
        }
        debug!("connected peer {}: {:?}", self.addr, handshake.peer_id);
        self.handler.on_handshake(&handshake)?;

        if read_so_far > consumed {
            read_buf.copy_within(consumed..read_so_far, 0);
        }
        read_so_far -= consumed;

        self.run(conn, read_buf, read_so_far, handshake.supports_extended(), rx)
            .await
    }

    /// Drives an accepted connection whose handshake was already read
    /// by the acceptor; our own handshake still needs to be sent.
    pub async fn manage_peer_incoming(
        &self,
        mut conn: TcpStream,
        handshake: Handshake,
        read_buf: Vec<u8>,
        read_so_far: usize,
        rx: PeerRx,
    ) -> Result<()> {
        if handshake.info_hash != self.info_hash {
            return Err(Error::WrongInfoHash);
        }
        let mut buf = Vec::with_capacity(128);
        Handshake::new(self.info_hash, self.peer_id).serialize(&mut buf);
        conn.write_all(&buf).await.map_err(Error::WriteHandshake)?;
        self.handler.on_handshake(&handshake)?;
        self.run(conn, read_buf, read_so_far, handshake.supports_extended(), rx)
            .await
    }

    async fn run(
        &self,
        conn: TcpStream,
        mut read_buf: Vec<u8>,
        mut read_so_far: usize,
        peer_supports_extended: bool,
        mut outgoing_chan: PeerRx,
    ) -> Result<()> {
        let (mut read_half, mut write_half) = conn.into_split();

        let writer = async {
            let mut buf = Vec::<u8>::with_capacity(PIECE_MESSAGE_DEFAULT_LEN);
            let keep_alive_interval = self.options.keep_alive_interval;

            if peer_supports_extended {
                if let Some(eh) = self.handler.extended_handshake() {
                    let msg = MessageOwned::Extended(ExtendedMessage::Handshake(eh));
                    let len = msg
                        .serialize(&mut buf, &|| self.handler.peer_extended_msg_ids())
                        .map_err(Error::Anyhow)?;
                    write_half
                        .write_all(&buf[..len])
                        .await
                        .map_err(Error::Write)?;
                    trace!("sent extended handshake to {}", self.addr);
                }
            }

            if let Some(len) = self
                .handler
                .serialize_bitfield_message_to_buf(&mut buf)
                .map_err(Error::Anyhow)?
            {
                write_half
                    .write_all(&buf[..len])
                    .await
                    .map_err(Error::Write)?;
                trace!("sent bitfield to {}", self.addr);
            }

            loop {
                let req = match timeout(keep_alive_interval, outgoing_chan.recv()).await {
                    Ok(Some(req)) => req,
                    Ok(None) => return Err(Error::PeerTaskDead),
                    Err(_) => WriterRequest::Message(MessageOwned::KeepAlive),
                };

                let mut uploaded_add = None;

                let len = match &req {
                    WriterRequest::Message(msg) => msg
                        .serialize(&mut buf, &|| self.handler.peer_extended_msg_ids())
                        .map_err(Error::Anyhow)?,
                    WriterRequest::Block(block) => {
                        if !self.handler.should_send_block(block) {
                            trace!("block {:?} was cancelled, dropping", block.block);
                            continue;
                        }
                        buf.resize(PIECE_MESSAGE_DEFAULT_LEN, 0);
                        let preamble_len = serialize_piece_preamble(&block.block, &mut buf);
                        let full_len = preamble_len + block.data.len();
                        buf.truncate(preamble_len);
                        buf.extend_from_slice(&block.data);
                        uploaded_add = Some(block.block.size);
                        full_len
                    }
                    WriterRequest::Disconnect => return Ok(()),
                };

                trace!("sending to {}: {} bytes", self.addr, len);
                write_half
                    .write_all(&buf[..len])
                    .await
                    .map_err(Error::Write)?;

                if let Some(uploaded_add) = uploaded_add {
                    self.handler.on_uploaded_bytes(uploaded_add);
                }
            }
        };

        let reader = async {
            loop {
                let (message, size) = loop {
                    match MessageBorrowed::deserialize(&read_buf[..read_so_far]) {
                        Ok((msg, size)) => break (msg, size),
                        Err(e) if e.is_not_enough_data() => {
                            if read_so_far == read_buf.len() {
                                read_buf.resize(read_buf.len() * 2, 0);
                            }
                            let size = read_half
                                .read(&mut read_buf[read_so_far..])
                                .await
                                .map_err(Error::Read)?;
                            if size == 0 {
                                return Err(Error::PeerDisconnected);
                            }
                            read_so_far += size;
                        }
                        Err(e) => return Err(e.into()),
                    }
                };

                trace!("received from {}: {:?}", self.addr, &message);
                self.handler
                    .on_received_message(message)
                    .map_err(Error::Anyhow)?;

                if read_so_far > size {
                    read_buf.copy_within(size..read_so_far, 0);
                }
                read_so_far -= size;
            }
        };

        let r = tokio::select! {
            r = writer => r,
            r = reader => r,
        };
        debug!("{}: connection loop done: {:?}", self.addr, r.as_ref().err());
        r
    }
}
