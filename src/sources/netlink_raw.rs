//! Minimal netlink framing shared by the conntrack and netlog sources:
//! `nlmsghdr` parsing and generic nested-attribute (TLV) walking, in the
//! style of a hand-rolled netfilter netlink attribute walker.

pub const NLMSG_HDRLEN: usize = 16;
pub const NLA_HDRLEN: usize = 4;

pub struct NlMsgHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

pub fn parse_nlmsghdr(buf: &[u8]) -> Option<(NlMsgHeader, &[u8])> {
    if buf.len() < NLMSG_HDRLEN {
        return None;
    }
    let len = u32::from_ne_bytes(buf[0..4].try_into().ok()?);
    let msg_type = u16::from_ne_bytes(buf[4..6].try_into().ok()?);
    let flags = u16::from_ne_bytes(buf[6..8].try_into().ok()?);
    let seq = u32::from_ne_bytes(buf[8..12].try_into().ok()?);
    let pid = u32::from_ne_bytes(buf[12..16].try_into().ok()?);
    let body_len = (len as usize).saturating_sub(NLMSG_HDRLEN);
    let body = buf.get(NLMSG_HDRLEN..NLMSG_HDRLEN + body_len.min(buf.len() - NLMSG_HDRLEN))?;
    Some((
        NlMsgHeader {
            len,
            msg_type,
            flags,
            seq,
            pid,
        },
        body,
    ))
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// One nested netlink attribute: its type (with the nested/net-byte-order
/// flag bits masked off) and its raw value slice.
pub struct NlAttr<'a> {
    pub attr_type: u16,
    pub value: &'a [u8],
}

/// Walks a flat sequence of TLV-encoded attributes: `len:u16 |
/// type:u16 | value (padded to 4-byte alignment)`.
pub fn walk_attrs(mut buf: &[u8]) -> Vec<NlAttr<'_>> {
    const NLA_TYPE_MASK: u16 = !0xC000;
    let mut out = Vec::new();
    while buf.len() >= NLA_HDRLEN {
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let raw_type = u16::from_ne_bytes([buf[2], buf[3]]);
        if len < NLA_HDRLEN || len > buf.len() {
            break;
        }
        let value = &buf[NLA_HDRLEN..len];
        out.push(NlAttr {
            attr_type: raw_type & NLA_TYPE_MASK,
            value,
        });
        let consumed = align4(len);
        if consumed > buf.len() {
            break;
        }
        buf = &buf[consumed..];
    }
    out
}

pub fn be_u16(buf: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(buf.get(0..2)?.try_into().ok()?))
}

pub fn be_u32(buf: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(buf.get(0..4)?.try_into().ok()?))
}

pub fn be_u64(buf: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(buf.get(0..8)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_attr(attr_type: u16, value: &[u8]) -> Vec<u8> {
        let len = (NLA_HDRLEN + value.len()) as u16;
        let mut out = len.to_ne_bytes().to_vec();
        out.extend_from_slice(&attr_type.to_ne_bytes());
        out.extend_from_slice(value);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    #[test]
    fn walks_two_consecutive_attributes() {
        let mut buf = encode_attr(1, &[0xAA, 0xBB]);
        buf.extend(encode_attr(2, &4u32.to_be_bytes()));
        let attrs = walk_attrs(&buf);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].attr_type, 1);
        assert_eq!(attrs[0].value, &[0xAA, 0xBB]);
        assert_eq!(attrs[1].attr_type, 2);
        assert_eq!(be_u32(attrs[1].value), Some(4));
    }

    #[test]
    fn nested_flag_bits_are_masked_from_type() {
        let buf = encode_attr(1 | 0x8000, &[1]);
        let attrs = walk_attrs(&buf);
        assert_eq!(attrs[0].attr_type, 1);
    }
}
