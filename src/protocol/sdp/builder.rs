//! SDP text generation

use std::fmt::Write;

use super::SdpSession;

/// Emit a session as AES67 SDP text
///
/// The output is deterministic: session lines in RFC order, then
/// rtpmap, ptime, framecount, direction, optional source-filter,
/// ts-refclk and mediaclk, then preserved unknown attributes in sorted
/// order. `parse(emit(s))` reproduces `s` for every valid session.
#[must_use]
pub fn emit(session: &SdpSession) -> String {
    let mut sdp = String::with_capacity(512);

    sdp.push_str("v=0\n");

    let origin_address = if session.origin_address.is_empty() {
        "0.0.0.0"
    } else {
        &session.origin_address
    };
    let _ = writeln!(
        sdp,
        "o={} {} {} IN IP4 {}",
        session.origin_username, session.session_id, session.session_version, origin_address
    );

    let _ = writeln!(sdp, "s={}", session.session_name);

    if !session.session_info.is_empty() {
        let _ = writeln!(sdp, "i={}", session.session_info);
    }

    if session.ttl != 0 {
        let _ = writeln!(sdp, "c=IN IP4 {}/{}", session.connection_address, session.ttl);
    } else {
        let _ = writeln!(sdp, "c=IN IP4 {}", session.connection_address);
    }

    let _ = writeln!(sdp, "t={} {}", session.time_start, session.time_stop);

    let _ = writeln!(
        sdp,
        "m=audio {} RTP/AVP {}",
        session.port, session.payload_type
    );

    let _ = writeln!(
        sdp,
        "a=rtpmap:{} {}/{}/{}",
        session.payload_type,
        session.encoding.as_str(),
        session.sample_rate,
        session.num_channels
    );
    let _ = writeln!(sdp, "a=ptime:{}", session.ptime);
    let _ = writeln!(sdp, "a=framecount:{}", session.framecount);
    let _ = writeln!(sdp, "a={}", session.direction.as_str());

    if let Some(source) = session.source_address {
        let _ = writeln!(
            sdp,
            "a=source-filter: incl IN IP4 {} {}",
            session.connection_address, source
        );
    }

    if session.ptp_domain >= 0 && !session.ptp_master_mac.is_empty() {
        let _ = writeln!(
            sdp,
            "a=ts-refclk:ptp=IEEE1588-2008:{}:domain-nmbr={}",
            session.ptp_master_mac, session.ptp_domain
        );
    }

    if !session.media_clock.is_empty() {
        let _ = writeln!(sdp, "a=mediaclk:{}", session.media_clock);
    }

    for (name, value) in &session.attributes {
        if value.is_empty() {
            let _ = writeln!(sdp, "a={name}");
        } else {
            let _ = writeln!(sdp, "a={name}:{value}");
        }
    }

    sdp
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::super::parse;
    use super::*;
    use crate::types::{AudioEncoding, Direction};

    fn sample_session() -> SdpSession {
        let mut sdp = SdpSession::default_tx_session(
            "Stagebox 3",
            "192.168.40.7",
            Ipv4Addr::new(239, 12, 0, 3),
            5004,
            16,
            48_000,
            AudioEncoding::L24,
        );
        sdp.session_info = "FOH split".to_string();
        sdp.source_address = Some(Ipv4Addr::new(192, 168, 40, 7));
        sdp.ptp_master_mac = "00-1B-21-AC-B5-4F".to_string();
        sdp.ptp_domain = 0;
        sdp
    }

    #[test]
    fn test_emit_line_order() {
        let text = emit(&sample_session());
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "v=0");
        assert!(lines[1].starts_with("o=- "));
        assert_eq!(lines[2], "s=Stagebox 3");
        assert_eq!(lines[3], "i=FOH split");
        assert_eq!(lines[4], "c=IN IP4 239.12.0.3/32");
        assert_eq!(lines[5], "t=0 0");
        assert_eq!(lines[6], "m=audio 5004 RTP/AVP 97");
        assert_eq!(lines[7], "a=rtpmap:97 L24/48000/16");
        assert_eq!(lines[8], "a=ptime:1");
        assert_eq!(lines[9], "a=framecount:48");
        assert_eq!(lines[10], "a=sendonly");
        assert_eq!(
            lines[11],
            "a=source-filter: incl IN IP4 239.12.0.3 192.168.40.7"
        );
        assert_eq!(
            lines[12],
            "a=ts-refclk:ptp=IEEE1588-2008:00-1B-21-AC-B5-4F:domain-nmbr=0"
        );
        assert_eq!(lines[13], "a=mediaclk:direct=0");
    }

    #[test]
    fn test_emit_parse_round_trip() {
        let original = sample_session();
        let round = parse(&emit(&original)).unwrap();
        assert_eq!(round, original);
    }

    #[test]
    fn test_round_trip_preserves_unknown_attributes() {
        let mut original = sample_session();
        original
            .attributes
            .insert("keywds".to_string(), "monitor mix".to_string());
        original
            .attributes
            .insert("x-vendor".to_string(), String::new());

        let round = parse(&emit(&original)).unwrap();
        assert_eq!(round.attributes, original.attributes);
        assert_eq!(round, original);
    }

    #[test]
    fn test_round_trip_without_ptp() {
        let mut original = sample_session();
        original.ptp_domain = -1;
        original.ptp_master_mac.clear();
        original.source_address = None;

        let text = emit(&original);
        assert!(!text.contains("ts-refclk"));
        assert!(!text.contains("source-filter"));

        let round = parse(&text).unwrap();
        assert_eq!(round.ptp_domain, -1);
        assert_eq!(round, original);
    }

    #[test]
    fn test_round_trip_recvonly_l16() {
        let mut original = sample_session();
        original.encoding = AudioEncoding::L16;
        original.payload_type = 96;
        original.direction = Direction::RecvOnly;

        let round = parse(&emit(&original)).unwrap();
        assert_eq!(round, original);
    }
}
