//! Constraint checks applied to every token redemption.

use super::ArtifactError;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// `valid_from` is inclusive, `valid_to` exclusive.
pub fn check_window(
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), ArtifactError> {
    if valid_from.is_some_and(|from| now < from) {
        return Err(ArtifactError::NotYetValid);
    }
    if valid_to.is_some_and(|to| now >= to) {
        return Err(ArtifactError::Expired);
    }
    Ok(())
}

pub fn check_quota(max_uses: Option<i64>, current_uses: i64) -> Result<(), ArtifactError> {
    match max_uses {
        Some(max) if current_uses >= max => Err(ArtifactError::QuotaExceeded),
        _ => Ok(()),
    }
}

/// Parse a CIDR block such as `10.0.0.0/8` or `2001:db8::/32`.
///
/// A prefix length is mandatory; a bare address is not a block.
pub fn parse_cidr(raw: &str) -> Result<IpNetwork, String> {
    let raw = raw.trim();
    if !raw.contains('/') {
        return Err(format!("`{raw}` has no prefix length"));
    }
    raw.parse::<IpNetwork>()
        .map_err(|err| format!("`{raw}` is not a CIDR block: {err}"))
}

/// Unparsable stored CIDRs fail closed with `InvalidConfiguration`.
pub fn check_origin(allowed_cidr: Option<&str>, client_ip: IpAddr) -> Result<(), ArtifactError> {
    let Some(raw) = allowed_cidr.filter(|c| !c.trim().is_empty()) else {
        return Ok(());
    };
    let network = parse_cidr(raw).map_err(ArtifactError::InvalidConfiguration)?;
    if network.contains(client_ip.to_canonical()) {
        Ok(())
    } else {
        Err(ArtifactError::OriginNotAllowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn window_bounds_are_inclusive_from_exclusive_to() {
        let (from, to) = (Some(at(0)), Some(at(100)));
        assert_eq!(check_window(from, to, at(-1)), Err(ArtifactError::NotYetValid));
        assert_eq!(check_window(from, to, at(0)), Ok(()));
        assert_eq!(check_window(from, to, at(99)), Ok(()));
        assert_eq!(check_window(from, to, at(100)), Err(ArtifactError::Expired));
        assert_eq!(check_window(None, None, at(1_000_000)), Ok(()));
    }

    #[test]
    fn quota_blocks_at_limit() {
        assert_eq!(check_quota(None, 10_000), Ok(()));
        assert_eq!(check_quota(Some(2), 1), Ok(()));
        assert_eq!(check_quota(Some(2), 2), Err(ArtifactError::QuotaExceeded));
        assert_eq!(check_quota(Some(0), 0), Err(ArtifactError::QuotaExceeded));
    }

    #[test]
    fn origin_membership() {
        let inside: IpAddr = "10.1.2.3".parse().unwrap();
        let outside: IpAddr = "192.168.0.1".parse().unwrap();
        assert_eq!(check_origin(Some("10.0.0.0/8"), inside), Ok(()));
        assert_eq!(
            check_origin(Some("10.0.0.0/8"), outside),
            Err(ArtifactError::OriginNotAllowed)
        );
        assert_eq!(check_origin(None, outside), Ok(()));
        assert_eq!(check_origin(Some(""), outside), Ok(()));
    }

    #[test]
    fn ipv4_mapped_clients_match_ipv4_blocks() {
        let mapped: IpAddr = "::ffff:10.1.2.3".parse().unwrap();
        assert_eq!(check_origin(Some("10.0.0.0/8"), mapped), Ok(()));
    }

    #[test]
    fn ipv6_blocks() {
        let inside: IpAddr = "2001:db8::42".parse().unwrap();
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(check_origin(Some("2001:db8::/32"), inside), Ok(()));
        assert_eq!(
            check_origin(Some("2001:db8::/32"), v4),
            Err(ArtifactError::OriginNotAllowed)
        );
    }

    #[test]
    fn malformed_cidr_fails_closed() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        for bad in ["not-a-cidr", "10.0.0.0/33", "10.1.2.3"] {
            assert!(matches!(
                check_origin(Some(bad), ip),
                Err(ArtifactError::InvalidConfiguration(_))
            ));
        }
    }
}
