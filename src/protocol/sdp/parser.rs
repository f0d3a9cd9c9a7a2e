//! SDP text parsing

use std::net::Ipv4Addr;

use crate::error::{Aes67Error, Result, SdpParseError};
use crate::types::{AudioEncoding, Direction};

use super::SdpSession;

/// Parse an AES67 SDP blob into a validated session
///
/// Accepts both CRLF and LF line endings. Unrecognized attributes are
/// preserved verbatim in the session's attribute map.
///
/// # Errors
///
/// Returns `SdpParse` when a structurally required line is missing or
/// malformed, `SdpInvalid` when the parsed session fails validation
/// (empty session name, missing connection, zero port, unknown
/// encoding, zero rate or channels).
pub fn parse(input: &str) -> Result<SdpSession> {
    let mut session = SdpSession::default();
    session.session_name.clear();
    session.media_clock.clear();
    session.connection_address = Ipv4Addr::UNSPECIFIED;
    // No PTP reference unless a ts-refclk attribute announces one
    session.ptp_domain = -1;

    let mut has_version = false;
    let mut has_connection = false;
    let mut has_media = false;
    let mut has_framecount = false;

    for raw_line in input.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        // Every SDP line is a single type character followed by '='
        let Some((type_char, value)) = split_line(line) else {
            continue;
        };

        match type_char {
            'v' => {
                has_version = true;
            }
            'o' => parse_origin(value, &mut session)?,
            's' => {
                session.session_name = value.to_string();
            }
            'i' => {
                session.session_info = value.to_string();
            }
            'c' => {
                parse_connection(value, &mut session)?;
                has_connection = true;
            }
            't' => parse_timing(value, &mut session)?,
            'm' => {
                parse_media(value, &mut session)?;
                has_media = true;
            }
            'a' => parse_attribute(value, &mut session, &mut has_framecount)?,
            _ => {
                // Unknown line types are ignored
            }
        }
    }

    if !has_version {
        return Err(SdpParseError::MissingField("v").into());
    }
    if !has_connection {
        return Err(SdpParseError::MissingField("c").into());
    }
    if !has_media {
        return Err(SdpParseError::MissingField("m").into());
    }

    if !has_framecount {
        session.framecount = session.sample_rate / 1000 * session.ptime.max(1);
    }

    let errors = session.validation_errors();
    if !errors.is_empty() {
        return Err(Aes67Error::SdpInvalid {
            message: errors.join("; "),
        });
    }

    Ok(session)
}

fn split_line(line: &str) -> Option<(char, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 2 || !bytes[0].is_ascii() || bytes[1] != b'=' {
        return None;
    }
    Some((bytes[0] as char, &line[2..]))
}

fn parse_origin(value: &str, session: &mut SdpSession) -> Result<()> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 6 {
        return Err(SdpParseError::InvalidOrigin(value.to_string()).into());
    }

    session.origin_username = parts[0].to_string();
    session.session_id = parts[1]
        .parse()
        .map_err(|_| SdpParseError::InvalidOrigin(value.to_string()))?;
    session.session_version = parts[2]
        .parse()
        .map_err(|_| SdpParseError::InvalidOrigin(value.to_string()))?;
    session.origin_address = parts[5].to_string();
    Ok(())
}

fn parse_connection(value: &str, session: &mut SdpSession) -> Result<()> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(SdpParseError::InvalidConnection(value.to_string()).into());
    }

    // addr[/ttl]
    let (addr, ttl) = match parts[2].split_once('/') {
        Some((addr, ttl)) => {
            let ttl: u8 = ttl
                .parse()
                .map_err(|_| SdpParseError::InvalidConnection(value.to_string()))?;
            (addr, ttl)
        }
        None => (parts[2], session.ttl),
    };

    session.connection_address = addr
        .parse()
        .map_err(|_| SdpParseError::InvalidConnection(value.to_string()))?;
    session.ttl = ttl;
    Ok(())
}

fn parse_timing(value: &str, session: &mut SdpSession) -> Result<()> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(SdpParseError::InvalidTiming(value.to_string()).into());
    }
    session.time_start = parts[0]
        .parse()
        .map_err(|_| SdpParseError::InvalidTiming(value.to_string()))?;
    session.time_stop = parts[1]
        .parse()
        .map_err(|_| SdpParseError::InvalidTiming(value.to_string()))?;
    Ok(())
}

fn parse_media(value: &str, session: &mut SdpSession) -> Result<()> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "audio" {
        return Err(SdpParseError::InvalidMedia(value.to_string()).into());
    }

    session.port = parts[1]
        .parse()
        .map_err(|_| SdpParseError::InvalidMedia(value.to_string()))?;
    session.payload_type = parts[3]
        .parse::<u8>()
        .map_err(|_| SdpParseError::InvalidMedia(value.to_string()))?
        & 0x7F;
    Ok(())
}

fn parse_attribute(
    value: &str,
    session: &mut SdpSession,
    has_framecount: &mut bool,
) -> Result<()> {
    let (name, attr_value) = match value.split_once(':') {
        Some((name, v)) => (name, Some(v)),
        None => (value, None),
    };

    match (name, attr_value) {
        ("rtpmap", Some(v)) => parse_rtpmap(v, session),
        ("ptime", Some(v)) => {
            session.ptime = v
                .trim()
                .parse()
                .map_err(|_| SdpParseError::InvalidAttribute(format!("ptime:{v}")))?;
            Ok(())
        }
        ("framecount", Some(v)) => {
            session.framecount = v
                .trim()
                .parse()
                .map_err(|_| SdpParseError::InvalidAttribute(format!("framecount:{v}")))?;
            *has_framecount = true;
            Ok(())
        }
        ("source-filter", Some(v)) => {
            parse_source_filter(v, session);
            Ok(())
        }
        ("ts-refclk", Some(v)) => {
            if !parse_ts_refclk(v, session) {
                // Unrecognized reference clock forms are preserved verbatim
                session
                    .attributes
                    .insert(name.to_string(), v.to_string());
            }
            Ok(())
        }
        ("mediaclk", Some(v)) => {
            session.media_clock = v.to_string();
            Ok(())
        }
        (tag, None) if Direction::from_token(tag).is_some() => {
            session.direction = Direction::from_token(tag).unwrap_or_default();
            Ok(())
        }
        (name, v) => {
            session
                .attributes
                .insert(name.to_string(), v.unwrap_or_default().to_string());
            Ok(())
        }
    }
}

fn parse_rtpmap(value: &str, session: &mut SdpSession) -> Result<()> {
    // <pt> <encoding>/<rate>[/<channels>]
    let err = || SdpParseError::InvalidAttribute(format!("rtpmap:{value}"));

    let (pt, spec) = value.trim().split_once(' ').ok_or_else(err)?;
    session.payload_type = pt.parse::<u8>().map_err(|_| err())? & 0x7F;

    let mut fields = spec.trim().split('/');
    let encoding = fields.next().ok_or_else(err)?;
    let rate = fields.next().ok_or_else(err)?;

    session.encoding = AudioEncoding::from_token(encoding);
    session.sample_rate = rate.parse().map_err(|_| err())?;
    session.num_channels = match fields.next() {
        Some(channels) => channels.parse().map_err(|_| err())?,
        None => 1,
    };

    Ok(())
}

fn parse_source_filter(value: &str, session: &mut SdpSession) {
    // " incl IN IP4 <dst> <src>"
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() >= 5 && parts[0] == "incl" && parts[1] == "IN" && parts[2] == "IP4" {
        if let Ok(src) = parts[4].parse() {
            session.source_address = Some(src);
        }
    }
}

fn parse_ts_refclk(value: &str, session: &mut SdpSession) -> bool {
    // ptp=IEEE1588-2008:<mac>:domain-nmbr=<d>
    let Some(rest) = value.strip_prefix("ptp=IEEE1588-2008:") else {
        return false;
    };
    let Some((mac, domain)) = rest.rsplit_once(":domain-nmbr=") else {
        return false;
    };
    let valid_mac = !mac.is_empty()
        && mac
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-' || c == ':');
    if !valid_mac {
        return false;
    }
    let Ok(domain) = domain.parse::<i32>() else {
        return false;
    };

    session.ptp_master_mac = mac.to_string();
    session.ptp_domain = domain;
    true
}
