use crate::common::*;
use crate::protocol::{
    serde::{de_vec, ser_slice, De, Ser},
    types::{LogLevel, NicState, RankCounters, RankInfoHeader, SyncKind, RANK_INFO_HEADER_SIZE},
    CommandId, Rank, PARAM_SIZE,
};
use crate::runtime::errors::EndpointErr;

/// A typed coordination command. The parameter part of every variant encodes
/// into the fixed 512-byte param field; bulk data travels as payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    RankData { comm_size: u32, listen_port: u16, header: RankInfoHeader },
    CommData { comm_size: u32, table: Vec<RankInfoHeader> },
    /// From a rank: its row, `blobs[j]` addressed to rank `j`.
    /// From the server: the column for `rank`, `blobs[j]` coming from rank `j`.
    QpsConf { rank: Rank, comm_size: u32, blobs: Vec<Payload> },
    NonPeers { rank: Rank, blob: Payload },
    LogMsg { rank: Rank, level: LogLevel, timestamp_us: u64, text: String },
    Sync { rank: Rank, kind: SyncKind },
    NicState(NicState),
    /// From a rank: exactly its own counters. From the server: every rank's, by rank.
    CountersData { rank: Rank, comm_size: u32, all_reached: bool, counters: Vec<RankCounters> },
}

/// A command flattened into its wire parts.
#[derive(Debug)]
pub(crate) struct Encoded {
    pub id: CommandId,
    pub param: [u8; PARAM_SIZE],
    pub payload: Payload,
}

///////////////////// IMPL /////////////////////

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::RankData { .. } => CommandId::RankData,
            Command::CommData { .. } => CommandId::CommData,
            Command::QpsConf { .. } => CommandId::QpsConf,
            Command::NonPeers { .. } => CommandId::NonPeers,
            Command::LogMsg { .. } => CommandId::LogMsg,
            Command::Sync { .. } => CommandId::Sync,
            Command::NicState(..) => CommandId::NicState,
            Command::CountersData { .. } => CommandId::CountersData,
        }
    }

    /// Panics if the parameter part outgrows `PARAM_SIZE`.
    pub fn encode(&self) -> Encoded {
        let mut param: Vec<u8> = Vec::with_capacity(PARAM_SIZE);
        let mut payload: Payload = Vec::new();
        // writing into a Vec never fails
        let _ = self.write_parts(&mut param, &mut payload);
        assert!(
            param.len() <= PARAM_SIZE,
            "{:?} parameter is {} bytes; the limit is {}",
            self.id(),
            param.len(),
            PARAM_SIZE
        );
        let mut fixed = [0u8; PARAM_SIZE];
        fixed[..param.len()].copy_from_slice(&param);
        Encoded { id: self.id(), param: fixed, payload }
    }

    fn write_parts(&self, p: &mut Vec<u8>, payload: &mut Vec<u8>) -> Result<(), std::io::Error> {
        match self {
            Command::RankData { comm_size, listen_port, header } => {
                p.ser(comm_size)?;
                p.ser(listen_port)?;
                p.ser(header)
            }
            Command::CommData { comm_size, table } => {
                p.ser(comm_size)?;
                for h in table {
                    payload.ser(h)?;
                }
                Ok(())
            }
            Command::QpsConf { rank, comm_size, blobs } => {
                p.ser(rank)?;
                p.ser(comm_size)?;
                ser_slice(payload, blobs)
            }
            Command::NonPeers { rank, blob } => {
                p.ser(rank)?;
                payload.extend_from_slice(blob);
                Ok(())
            }
            Command::LogMsg { rank, level, timestamp_us, text } => {
                p.ser(rank)?;
                p.ser(&level.code())?;
                p.ser(timestamp_us)?;
                payload.extend_from_slice(text.as_bytes());
                Ok(())
            }
            Command::Sync { rank, kind } => {
                p.ser(rank)?;
                p.ser(&match kind {
                    SyncKind::Rendezvous => 0u8,
                    SyncKind::MigrationDone => 1u8,
                })
            }
            Command::NicState(NicState { rank, nic, up }) => {
                p.ser(rank)?;
                p.ser(nic)?;
                p.ser(up)
            }
            Command::CountersData { rank, comm_size, all_reached, counters } => {
                p.ser(rank)?;
                p.ser(comm_size)?;
                p.ser(all_reached)?;
                ser_slice(payload, counters)
            }
        }
    }

    /// Rebuilds a command from its wire parts. The payload must be consumed exactly.
    pub fn decode(id: CommandId, param: &[u8], payload: &[u8]) -> Result<Self, EndpointErr> {
        let bad_param = |_: std::io::Error| EndpointErr::MalformedParam(id);
        let bad_payload = |_: std::io::Error| EndpointErr::MalformedPayload(id);
        let mut p = param;
        let mut body = payload;
        let cmd = match id {
            CommandId::RankData => {
                let comm_size: u32 = p.de().map_err(bad_param)?;
                let listen_port: u16 = p.de().map_err(bad_param)?;
                let header: RankInfoHeader = p.de().map_err(bad_param)?;
                Command::RankData { comm_size, listen_port, header }
            }
            CommandId::CommData => {
                let comm_size: u32 = p.de().map_err(bad_param)?;
                if body.len() != comm_size as usize * RANK_INFO_HEADER_SIZE {
                    return Err(EndpointErr::MalformedPayload(id));
                }
                let mut table = Vec::with_capacity(comm_size as usize);
                for _ in 0..comm_size {
                    let h: RankInfoHeader = body.de().map_err(bad_payload)?;
                    table.push(h);
                }
                Command::CommData { comm_size, table }
            }
            CommandId::QpsConf => {
                let rank: Rank = p.de().map_err(bad_param)?;
                let comm_size: u32 = p.de().map_err(bad_param)?;
                let blobs: Vec<Payload> = de_vec(&mut body).map_err(bad_payload)?;
                Command::QpsConf { rank, comm_size, blobs }
            }
            CommandId::NonPeers => {
                let rank: Rank = p.de().map_err(bad_param)?;
                let blob = std::mem::take(&mut body).to_vec();
                Command::NonPeers { rank, blob }
            }
            CommandId::LogMsg => {
                let rank: Rank = p.de().map_err(bad_param)?;
                let code: u8 = p.de().map_err(bad_param)?;
                let level = LogLevel::from_code(code).ok_or(EndpointErr::MalformedParam(id))?;
                let timestamp_us: u64 = p.de().map_err(bad_param)?;
                let text = String::from_utf8(std::mem::take(&mut body).to_vec())
                    .map_err(|_| EndpointErr::MalformedPayload(id))?;
                Command::LogMsg { rank, level, timestamp_us, text }
            }
            CommandId::Sync => {
                let rank: Rank = p.de().map_err(bad_param)?;
                let code: u8 = p.de().map_err(bad_param)?;
                let kind = match code {
                    0 => SyncKind::Rendezvous,
                    1 => SyncKind::MigrationDone,
                    _ => return Err(EndpointErr::MalformedParam(id)),
                };
                Command::Sync { rank, kind }
            }
            CommandId::NicState => {
                let rank: Rank = p.de().map_err(bad_param)?;
                let nic: u32 = p.de().map_err(bad_param)?;
                let up: bool = p.de().map_err(bad_param)?;
                Command::NicState(NicState { rank, nic, up })
            }
            CommandId::CountersData => {
                let rank: Rank = p.de().map_err(bad_param)?;
                let comm_size: u32 = p.de().map_err(bad_param)?;
                let all_reached: bool = p.de().map_err(bad_param)?;
                let counters: Vec<RankCounters> = de_vec(&mut body).map_err(bad_payload)?;
                Command::CountersData { rank, comm_size, all_reached, counters }
            }
        };
        if !body.is_empty() {
            return Err(EndpointErr::MalformedPayload(id));
        }
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SERVER_RANK;

    fn roundtrip(cmd: Command) {
        let Encoded { id, param, payload } = cmd.encode();
        assert_eq!(id, cmd.id());
        assert_eq!(Command::decode(id, &param, &payload), Ok(cmd));
    }

    #[test]
    fn catalog_roundtrips() {
        let mut header = RankInfoHeader::new(2, 4, "box-0");
        header.caddr = "10.1.2.3:5555".parse().unwrap();
        roundtrip(Command::RankData { comm_size: 4, listen_port: 5555, header: header.clone() });
        roundtrip(Command::CommData { comm_size: 2, table: vec![header.clone(), header] });
        roundtrip(Command::QpsConf { rank: 1, comm_size: 3, blobs: vec![vec![], vec![1; 300], vec![2]] });
        roundtrip(Command::NonPeers { rank: 7, blob: (0..=255).collect() });
        roundtrip(Command::LogMsg {
            rank: SERVER_RANK,
            level: LogLevel::Critical,
            timestamp_us: 1_600_000_000_000_000,
            text: "box size mismatch".into(),
        });
        roundtrip(Command::Sync { rank: 0, kind: SyncKind::MigrationDone });
        roundtrip(Command::NicState(NicState { rank: 3, nic: 21, up: false }));
        roundtrip(Command::CountersData {
            rank: 1,
            comm_size: 2,
            all_reached: true,
            counters: vec![RankCounters::new(0, 2), RankCounters::new(1, 2)],
        });
    }

    #[test]
    fn trailing_payload_rejected() {
        let Encoded { id, param, mut payload } =
            Command::Sync { rank: 0, kind: SyncKind::Rendezvous }.encode();
        payload.push(1);
        assert_eq!(Command::decode(id, &param, &payload), Err(EndpointErr::MalformedPayload(id)));
    }

    #[test]
    fn short_table_rejected() {
        let Encoded { id, param, mut payload } =
            Command::CommData { comm_size: 1, table: vec![RankInfoHeader::new(0, 1, "h")] }.encode();
        payload.pop();
        assert_eq!(Command::decode(id, &param, &payload), Err(EndpointErr::MalformedPayload(id)));
    }

    #[test]
    fn unknown_sync_kind_rejected() {
        let Encoded { id, mut param, payload } =
            Command::Sync { rank: 0, kind: SyncKind::Rendezvous }.encode();
        param[4] = 9;
        assert_eq!(Command::decode(id, &param, &payload), Err(EndpointErr::MalformedParam(id)));
    }
}
