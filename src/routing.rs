use crate::cmd::CommandFlags;
use crate::config::EndpointAddr;
use crate::errors::{Error, Result};

pub(crate) const SLOT_COUNT: u16 = 16384;

fn crc_slot(key: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(key) % SLOT_COUNT
}

/// The bytes between the first `{` and the next `}`, if non-empty.
fn hashtag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|v| *v == b'{')?;

    let close = key[open..].iter().position(|v| *v == b'}')?;

    let tag = &key[open + 1..open + close];
    (!tag.is_empty()).then_some(tag)
}

/// The cluster slot that owns `key`: CRC16 (XMODEM) of the hash tag, or of
/// the whole key when no tag is present, mod 16384.
pub fn hash_slot(key: &[u8]) -> u16 {
    let key = match hashtag(key) {
        Some(tag) => tag,
        None => key,
    };

    crc_slot(key)
}

/// Folds the slots of a multi-key command. Keys landing on different slots
/// are rejected before any bridge is touched.
pub fn combined_slot<'a>(keys: impl IntoIterator<Item = &'a [u8]>) -> Result<Option<u16>> {
    let mut combined = None;
    for key in keys {
        let slot = hash_slot(key);
        match combined {
            None => combined = Some(slot),
            Some(existing) if existing != slot => return Err(Error::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(combined)
}

/// A cluster redirection parsed out of a `-` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    /// The slot has permanently moved; update the slot map.
    Moved { slot: u16, addr: EndpointAddr },
    /// The slot is migrating; retry this one command there with ASKING.
    Ask { slot: u16, addr: EndpointAddr },
}

impl Redirect {
    pub(crate) fn parse(error: &[u8]) -> Option<Redirect> {
        let text = std::str::from_utf8(error).ok()?;
        let (kind, rest) = if let Some(rest) = text.strip_prefix("MOVED ") {
            (true, rest)
        } else if let Some(rest) = text.strip_prefix("ASK ") {
            (false, rest)
        } else {
            return None;
        };
        let mut parts = rest.split_ascii_whitespace();
        let slot = parts.next()?.parse::<u16>().ok()?;
        if slot >= SLOT_COUNT {
            return None;
        }
        let (host, port) = parts.next()?.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() {
            return None;
        }
        let addr = EndpointAddr::new(host, port);
        Some(if kind {
            Redirect::Moved { slot, addr }
        } else {
            Redirect::Ask { slot, addr }
        })
    }
}

/// Where a command wants to land, resolved from its flags. Demand variants
/// fail when the wanted role is unavailable; prefer variants fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerPreference {
    DemandPrimary,
    DemandReplica,
    PreferPrimary,
    PreferReplica,
}

impl ServerPreference {
    pub(crate) fn from_flags(flags: CommandFlags) -> ServerPreference {
        if flags.contains(CommandFlags::DEMAND_PRIMARY) {
            ServerPreference::DemandPrimary
        } else if flags.contains(CommandFlags::DEMAND_REPLICA) {
            ServerPreference::DemandReplica
        } else if flags.contains(CommandFlags::PREFER_REPLICA) {
            ServerPreference::PreferReplica
        } else {
            ServerPreference::PreferPrimary
        }
    }

    pub(crate) fn wants_replica(self) -> bool {
        matches!(
            self,
            ServerPreference::DemandReplica | ServerPreference::PreferReplica
        )
    }
}
