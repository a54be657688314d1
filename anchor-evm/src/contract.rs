use alloy::{
    primitives::{FixedBytes, U256},
    sol,
    sol_types::SolCall,
};

use passport_anchor_service::AnchorCall;

// Solidity interface of the passport anchor contract
sol! {
    #[derive(Debug)]
    interface IPassportAnchor {
        /// Record a digest for a passport id
        function anchor(bytes32 passportId, bytes32 digest, string algo, string uri, uint256 version) external;

        /// Emitted once per successful anchor call. No parameter is indexed.
        event Anchored(bytes32 passportId, bytes32 digest, string algo, string uri, uint256 version);
    }
}

pub use IPassportAnchor::Anchored;

/// ABI encoded calldata for an anchor call.
pub fn anchor_calldata(call: &AnchorCall) -> Vec<u8> {
    IPassportAnchor::anchorCall {
        passportId: FixedBytes::from(*call.passport_id.as_bytes()),
        digest: FixedBytes::from(*call.digest.as_bytes()),
        algo: call.algo.clone(),
        uri: call.uri.clone(),
        version: U256::from(call.version),
    }
    .abi_encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolEvent;
    use expect_test::expect;
    use passport_anchor_service::FeeOverrides;
    use passport_core::{Digest, PassportId};

    #[test]
    fn anchor_selector() {
        expect![[r#"24bde7d9"#]].assert_eq(&hex::encode(IPassportAnchor::anchorCall::SELECTOR));
    }

    #[test]
    fn anchored_topic() {
        expect![[r#"0x7fe34cf8f330951f1134e609554bfb67744317779c9de51d810f7459d9769012"#]]
            .assert_eq(&format!("0x{:x}", Anchored::SIGNATURE_HASH));
    }

    #[test]
    fn calldata_layout() {
        let call = AnchorCall {
            passport_id: PassportId::from_record_id("obj1"),
            digest: Digest::from_bytes([0x11; 32]),
            algo: "keccak256".to_owned(),
            uri: "ipfs://x".to_owned(),
            version: 3,
            fees: FeeOverrides::default(),
        };
        let data = anchor_calldata(&call);
        assert_eq!(&data[..4], &IPassportAnchor::anchorCall::SELECTOR);
        assert_eq!(&data[4..8], b"obj1");
        assert_eq!(&data[36..68], &[0x11; 32]);
        // version is the fifth head word
        assert_eq!(data[4 + 32 * 5 - 1], 3);

        let decoded = IPassportAnchor::anchorCall::abi_decode(&data, true).unwrap();
        assert_eq!(decoded.uri, "ipfs://x");
        assert_eq!(decoded.version, U256::from(3));
    }
}
