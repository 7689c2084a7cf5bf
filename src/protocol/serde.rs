use crate::common::*;
use crate::protocol::types::{
    RankCounters, RankInfoHeader, RemoteDeviceConnectionInfo, HOSTNAME_SIZE,
};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{
    ErrorKind::{InvalidData, UnexpectedEof},
    Read, Write,
};
use std::net::{Ipv4Addr, Ipv6Addr};

// Multi-byte integers travel in host byte order.

pub trait Ser<T>: Write {
    fn ser(&mut self, t: &T) -> Result<(), std::io::Error>;
}
pub trait De<T>: Read {
    fn de(&mut self) -> Result<T, std::io::Error>;
}

/////////////////////////////////////////

macro_rules! ser_seq {
    ( $w:expr ) => {{
        io::Result::Ok(())
    }};
    ( $w:expr, $first:expr ) => {{
        $w.ser($first)
    }};
    ( $w:expr, $first:expr, $( $x:expr ),+ ) => {{
        $w.ser($first)?;
        ser_seq![$w, $( $x ),*]
    }};
}
/////////////////////////////////////////

impl<W: Write> Ser<u8> for W {
    fn ser(&mut self, t: &u8) -> Result<(), std::io::Error> {
        self.write_u8(*t)
    }
}
impl<R: Read> De<u8> for R {
    fn de(&mut self) -> Result<u8, std::io::Error> {
        self.read_u8()
    }
}

impl<W: Write> Ser<u16> for W {
    fn ser(&mut self, t: &u16) -> Result<(), std::io::Error> {
        self.write_u16::<NativeEndian>(*t)
    }
}
impl<R: Read> De<u16> for R {
    fn de(&mut self) -> Result<u16, std::io::Error> {
        self.read_u16::<NativeEndian>()
    }
}

impl<W: Write> Ser<u32> for W {
    fn ser(&mut self, t: &u32) -> Result<(), std::io::Error> {
        self.write_u32::<NativeEndian>(*t)
    }
}
impl<R: Read> De<u32> for R {
    fn de(&mut self) -> Result<u32, std::io::Error> {
        self.read_u32::<NativeEndian>()
    }
}

impl<W: Write> Ser<u64> for W {
    fn ser(&mut self, t: &u64) -> Result<(), std::io::Error> {
        self.write_u64::<NativeEndian>(*t)
    }
}
impl<R: Read> De<u64> for R {
    fn de(&mut self) -> Result<u64, std::io::Error> {
        self.read_u64::<NativeEndian>()
    }
}

impl<W: Write> Ser<bool> for W {
    fn ser(&mut self, t: &bool) -> Result<(), std::io::Error> {
        self.ser(&match t {
            true => b'T',
            false => b'F',
        })
    }
}
impl<R: Read> De<bool> for R {
    fn de(&mut self) -> Result<bool, std::io::Error> {
        let b: u8 = self.de()?;
        Ok(match b {
            b'T' => true,
            b'F' => false,
            _ => return Err(InvalidData.into()),
        })
    }
}

pub(crate) struct ZigZag(pub u64);
impl<W: Write> Ser<ZigZag> for W {
    fn ser(&mut self, t: &ZigZag) -> Result<(), std::io::Error> {
        integer_encoding::VarIntWriter::write_varint(self, t.0).map(|_| ())
    }
}
impl<R: Read> De<ZigZag> for R {
    fn de(&mut self) -> Result<ZigZag, std::io::Error> {
        integer_encoding::VarIntReader::read_varint(self).map(ZigZag)
    }
}

impl<W: Write> Ser<Payload> for W {
    fn ser(&mut self, t: &Payload) -> Result<(), std::io::Error> {
        self.ser(&ZigZag(t.len() as u64))?;
        self.write_all(t)
    }
}
impl<R: Read> De<Payload> for R {
    fn de(&mut self) -> Result<Payload, std::io::Error> {
        let ZigZag(len) = self.de()?;
        // a bogus length runs out of input rather than memory
        let mut x = Vec::new();
        self.by_ref().take(len).read_to_end(&mut x)?;
        if x.len() as u64 != len {
            return Err(UnexpectedEof.into());
        }
        Ok(x)
    }
}

/// Length-prefixed sequence of any serializable element.
pub(crate) fn ser_slice<W: Write, T>(w: &mut W, ts: &[T]) -> Result<(), std::io::Error>
where
    W: Ser<T>,
{
    <W as Ser<ZigZag>>::ser(w, &ZigZag(ts.len() as u64))?;
    for t in ts {
        w.ser(t)?;
    }
    Ok(())
}
pub(crate) fn de_vec<R: Read, T>(r: &mut R) -> Result<Vec<T>, std::io::Error>
where
    R: De<T>,
{
    let ZigZag(len) = <R as De<ZigZag>>::de(r)?;
    let mut x = Vec::with_capacity((len as usize).min(1024));
    for _ in 0..len {
        x.push(r.de()?);
    }
    Ok(x)
}

impl<W: Write> Ser<IpAddr> for W {
    fn ser(&mut self, t: &IpAddr) -> Result<(), std::io::Error> {
        match t {
            IpAddr::V4(ip) => {
                self.ser(&4u8)?;
                self.write_all(&ip.octets())
            }
            IpAddr::V6(ip) => {
                self.ser(&6u8)?;
                self.write_all(&ip.octets())
            }
        }
    }
}
impl<R: Read> De<IpAddr> for R {
    fn de(&mut self) -> Result<IpAddr, std::io::Error> {
        let tag: u8 = self.de()?;
        Ok(match tag {
            4 => {
                let mut octets = [0u8; 4];
                self.read_exact(&mut octets)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                let mut octets = [0u8; 16];
                self.read_exact(&mut octets)?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(InvalidData.into()),
        })
    }
}

// fixed 20 bytes: family, port, 16 address bytes (v4 uses the first 4)
impl<W: Write> Ser<SocketAddr> for W {
    fn ser(&mut self, t: &SocketAddr) -> Result<(), std::io::Error> {
        let mut octets = [0u8; 16];
        let family: u16 = match t.ip() {
            IpAddr::V4(ip) => {
                octets[..4].copy_from_slice(&ip.octets());
                4
            }
            IpAddr::V6(ip) => {
                octets.copy_from_slice(&ip.octets());
                6
            }
        };
        ser_seq![self, &family, &t.port()]?;
        self.write_all(&octets)
    }
}
impl<R: Read> De<SocketAddr> for R {
    fn de(&mut self) -> Result<SocketAddr, std::io::Error> {
        let family: u16 = self.de()?;
        let port: u16 = self.de()?;
        let mut octets = [0u8; 16];
        self.read_exact(&mut octets)?;
        let ip = match family {
            4 => IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
            6 => IpAddr::V6(Ipv6Addr::from(octets)),
            _ => return Err(InvalidData.into()),
        };
        Ok(SocketAddr::new(ip, port))
    }
}

impl<W: Write> Ser<RankInfoHeader> for W {
    fn ser(&mut self, t: &RankInfoHeader) -> Result<(), std::io::Error> {
        let RankInfoHeader {
            hccl_rank,
            box_size,
            hw_module_id,
            hostname,
            caddr,
            api_counter,
            ip_addressing,
            failed_scaleout_ports,
        } = t;
        ser_seq![self, hccl_rank, box_size, hw_module_id]?;
        // NUL-padded, always NUL-terminated
        let mut name = [0u8; HOSTNAME_SIZE];
        let mut len = hostname.len().min(HOSTNAME_SIZE - 1);
        while !hostname.is_char_boundary(len) {
            len -= 1;
        }
        name[..len].copy_from_slice(&hostname.as_bytes()[..len]);
        self.write_all(&name)?;
        ser_seq![self, caddr, api_counter, ip_addressing, failed_scaleout_ports]
    }
}
impl<R: Read> De<RankInfoHeader> for R {
    fn de(&mut self) -> Result<RankInfoHeader, std::io::Error> {
        let hccl_rank: u32 = self.de()?;
        let box_size: u32 = self.de()?;
        let hw_module_id: u32 = self.de()?;
        let mut name = [0u8; HOSTNAME_SIZE];
        self.read_exact(&mut name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(HOSTNAME_SIZE);
        let hostname = String::from_utf8(name[..end].to_vec()).map_err(|_| InvalidData)?;
        Ok(RankInfoHeader {
            hccl_rank,
            box_size,
            hw_module_id,
            hostname,
            caddr: self.de()?,
            api_counter: self.de()?,
            ip_addressing: self.de()?,
            failed_scaleout_ports: self.de()?,
        })
    }
}

impl<W: Write> Ser<RankCounters> for W {
    fn ser(&mut self, t: &RankCounters) -> Result<(), std::io::Error> {
        let RankCounters { rank, collectives, reached, sent, observed } = t;
        ser_seq![self, rank, collectives, reached]?;
        ser_slice(self, sent)?;
        ser_slice(self, observed)
    }
}
impl<R: Read> De<RankCounters> for R {
    fn de(&mut self) -> Result<RankCounters, std::io::Error> {
        Ok(RankCounters {
            rank: self.de()?,
            collectives: self.de()?,
            reached: self.de()?,
            sent: de_vec(self)?,
            observed: de_vec(self)?,
        })
    }
}

impl<W: Write> Ser<RemoteDeviceConnectionInfo> for W {
    fn ser(&mut self, t: &RemoteDeviceConnectionInfo) -> Result<(), std::io::Error> {
        let RemoteDeviceConnectionInfo { header, nic_addrs, qp_numbers, host_nic_blob } = t;
        self.ser(header)?;
        ser_slice(self, nic_addrs)?;
        self.ser(&ZigZag(qp_numbers.len() as u64))?;
        for qps in qp_numbers {
            ser_slice(self, qps)?;
        }
        self.ser(host_nic_blob)
    }
}
impl<R: Read> De<RemoteDeviceConnectionInfo> for R {
    fn de(&mut self) -> Result<RemoteDeviceConnectionInfo, std::io::Error> {
        let header: RankInfoHeader = self.de()?;
        let nic_addrs: Vec<IpAddr> = de_vec(self)?;
        let ZigZag(nics) = self.de()?;
        let mut qp_numbers = Vec::with_capacity((nics as usize).min(64));
        for _ in 0..nics {
            qp_numbers.push(de_vec(self)?);
        }
        Ok(RemoteDeviceConnectionInfo { header, nic_addrs, qp_numbers, host_nic_blob: self.de()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::RANK_INFO_HEADER_SIZE;

    #[test]
    fn header_has_fixed_size() {
        let mut h = RankInfoHeader::new(1, 4, "a-rather-long-hostname");
        h.caddr = "[fe80::2]:99".parse().unwrap();
        let mut v = vec![];
        v.ser(&h).unwrap();
        assert_eq!(v.len(), RANK_INFO_HEADER_SIZE);
        let h2: RankInfoHeader = (&v[..]).de().unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn long_hostname_truncated() {
        let h = RankInfoHeader::new(0, 1, &"x".repeat(100));
        let mut v = vec![];
        v.ser(&h).unwrap();
        assert_eq!(v.len(), RANK_INFO_HEADER_SIZE);
        let h2: RankInfoHeader = (&v[..]).de().unwrap();
        assert_eq!(h2.hostname.len(), HOSTNAME_SIZE - 1);
    }

    #[test]
    fn integers_in_host_order() {
        let mut v = vec![];
        v.ser(&0x0102_0304u32).unwrap();
        assert_eq!(v, 0x0102_0304u32.to_ne_bytes());
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut v = vec![];
        v.ser(&ZigZag(10)).unwrap();
        v.extend_from_slice(&[1, 2, 3]);
        let got: Result<Payload, _> = (&v[..]).de();
        assert_eq!(got.unwrap_err().kind(), UnexpectedEof);
    }

    #[test]
    fn bad_bool_rejected() {
        let got: Result<bool, _> = (&b"X"[..]).de();
        assert_eq!(got.unwrap_err().kind(), InvalidData);
    }
}
