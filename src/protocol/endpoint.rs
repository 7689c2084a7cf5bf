use crate::common::*;
use crate::net::SocketIo;
use crate::protocol::{
    command::Encoded, decode_header, encode_header, Command, CommandId, Message, PacketType,
    HEADER_SIZE, MESSAGE_SIZE,
};
use crate::runtime::errors::EndpointErr;

/// What the next inbound packet must be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Expect {
    Any,
    Command(CommandId),
    Ack,
}

#[derive(Debug)]
pub(crate) enum Inbound {
    Command(Command),
    Ack,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Sent,
    AckSent,
}

#[derive(Debug)]
enum RecvStage {
    Idle,
    Header { expect: Expect },
    Message { expect: Expect },
    Payload { id: CommandId, message: Message },
}

#[derive(Debug)]
enum SendStage {
    Idle,
    Packet { payload: Option<Payload> },
    Payload,
    Ack,
}

/// Drives the packet state machine of one connection over its `SocketIo`.
/// Performs no I/O itself: it queues socket ops and digests their completions.
#[derive(Debug)]
pub(crate) struct Endpoint {
    recv: RecvStage,
    send: SendStage,
    max_payload: usize,
}

///////////////////// IMPL /////////////////////

impl Endpoint {
    pub fn new(max_payload: usize) -> Self {
        Self { recv: RecvStage::Idle, send: SendStage::Idle, max_payload }
    }

    pub fn is_receiving(&self) -> bool {
        !matches!(self.recv, RecvStage::Idle)
    }
    pub fn is_sending(&self) -> bool {
        !matches!(self.send, SendStage::Idle)
    }

    /// Arm the receive side for one packet.
    pub fn receive(&mut self, expect: Expect, io: &mut SocketIo) {
        assert!(!self.is_receiving(), "receive already armed");
        self.recv = RecvStage::Header { expect };
        io.recv(HEADER_SIZE);
    }

    /// Header and message go out in one write; a payload follows separately.
    pub fn send_command(&mut self, cmd: &Command, io: &mut SocketIo) {
        assert!(!self.is_sending(), "send already in flight");
        let Encoded { id, param, payload } = cmd.encode();
        let mut packet = encode_header(PacketType::Data);
        Message { id: id.wire(), param, payload_size: payload.len() as u32 }.encode(&mut packet);
        debug_assert_eq!(packet.len(), HEADER_SIZE + MESSAGE_SIZE);
        trace!("sending {:?} with {} payload bytes to {}", id, payload.len(), io.peer_addr());
        self.send = SendStage::Packet { payload: if payload.is_empty() { None } else { Some(payload) } };
        io.send(packet);
    }

    pub fn send_ack(&mut self, io: &mut SocketIo) {
        assert!(!self.is_sending(), "send already in flight");
        self.send = SendStage::Ack;
        io.send(encode_header(PacketType::Ack));
    }

    /// Called when a queued send completed.
    pub fn on_sent(&mut self, io: &mut SocketIo) -> Option<Outbound> {
        match std::mem::replace(&mut self.send, SendStage::Idle) {
            SendStage::Packet { payload: Some(payload) } => {
                self.send = SendStage::Payload;
                io.send(payload);
                None
            }
            SendStage::Packet { payload: None } | SendStage::Payload => Some(Outbound::Sent),
            SendStage::Ack => Some(Outbound::AckSent),
            SendStage::Idle => None,
        }
    }

    /// Called when a queued receive completed. Any error is terminal for the connection.
    pub fn on_received(&mut self, buf: Payload, io: &mut SocketIo) -> Result<Option<Inbound>, EndpointErr> {
        match std::mem::replace(&mut self.recv, RecvStage::Idle) {
            RecvStage::Idle => Ok(None),
            RecvStage::Header { expect } => match (decode_header(&buf)?, expect) {
                (PacketType::Ack, Expect::Ack) => Ok(Some(Inbound::Ack)),
                (PacketType::Data, Expect::Any) | (PacketType::Data, Expect::Command(_)) => {
                    self.recv = RecvStage::Message { expect };
                    io.recv(MESSAGE_SIZE);
                    Ok(None)
                }
                _ => Err(EndpointErr::UnexpectedPacket),
            },
            RecvStage::Message { expect } => {
                let message = Message::decode(&buf)?;
                let id = CommandId::from_wire(message.id).ok_or(EndpointErr::UnknownCommand(message.id))?;
                if let Expect::Command(expected) = expect {
                    if expected != id {
                        return Err(EndpointErr::UnexpectedCommand { expected, got: id });
                    }
                }
                let size = message.payload_size as usize;
                if size > self.max_payload {
                    return Err(EndpointErr::PayloadTooLarge { size, max: self.max_payload });
                }
                if size == 0 {
                    return Command::decode(id, &message.param, &[]).map(|c| Some(Inbound::Command(c)));
                }
                self.recv = RecvStage::Payload { id, message };
                io.recv(size);
                Ok(None)
            }
            RecvStage::Payload { id, message } => {
                Command::decode(id, &message.param, &buf).map(|c| Some(Inbound::Command(c)))
            }
        }
    }
}
