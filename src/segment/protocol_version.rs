use super::WireError;

/// The oldest protocol version that can still be decoded
pub const PROTOCOL_VERSION_LEGACY_MIN: u8 = 10;

/// The first version that knows about `AcknowledgeSegments` segments
pub const PROTOCOL_VERSION_ACKNOWLEDGE_SEGMENTS: u8 = 11;

/// Widened data chunk fields and message flags
pub const PROTOCOL_VERSION_CURRENT: u8 = 12;

pub fn is_legacy(protocol_version: u8) -> bool {
    protocol_version < PROTOCOL_VERSION_CURRENT
}

pub fn check_decodable(protocol_version: u8) -> Result<(), WireError> {
    if (PROTOCOL_VERSION_LEGACY_MIN..=PROTOCOL_VERSION_CURRENT).contains(&protocol_version) {
        Ok(())
    }
    else {
        Err(WireError::UnsupportedVersion(protocol_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::too_old(9, false)]
    #[case::legacy_10(10, true)]
    #[case::legacy_11(11, true)]
    #[case::current(12, true)]
    #[case::future(13, false)]
    fn test_check_decodable(#[case] version: u8, #[case] expected: bool) {
        assert_eq!(check_decodable(version).is_ok(), expected);
        if !expected {
            assert_eq!(check_decodable(version), Err(WireError::UnsupportedVersion(version)));
        }
    }
}
