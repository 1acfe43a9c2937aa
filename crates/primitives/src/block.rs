use alloy_primitives::{keccak256, Bytes, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};

/// A block header.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Header {
    /// Hash of the parent block header.
    pub parent_hash: B256,
    /// Height of the block.
    pub number: u64,
    /// Unix timestamp the block was proposed at.
    pub timestamp: u64,
    /// Opaque consensus payload.
    pub extra: Bytes,
}

impl Header {
    /// Hash of the RLP-encoded header.
    pub fn hash(&self) -> B256 {
        let mut out = Vec::with_capacity(self.length());
        self.encode(&mut out);
        keccak256(out)
    }
}

/// A block as it travels over the sync wire.
///
/// The commit signature of the committing quorum is carried out-of-band by
/// raw block responses and attached before verification; it is not part of
/// the wire encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// Raw transaction payloads.
    pub transactions: Vec<Bytes>,
    commit_sig: Option<Bytes>,
}

impl Block {
    /// Create a new block from its wire parts.
    pub fn new(header: Header, transactions: Vec<Bytes>) -> Self {
        Self { header, transactions, commit_sig: None }
    }

    /// The height of the block.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// The hash of the block header.
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    /// Attach the commit signature delivered alongside the block body.
    pub fn set_commit_sig(&mut self, sig: Bytes) {
        self.commit_sig = Some(sig);
    }

    /// The commit signature, if one has been attached.
    pub fn commit_sig(&self) -> Option<&Bytes> {
        self.commit_sig.as_ref()
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.header.length() + self.transactions.length();
        alloy_rlp::Header { list: true, payload_length }.encode(out);
        self.header.encode(out);
        self.transactions.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.header.length() + self.transactions.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = alloy_rlp::Header::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString)
        }
        let header = Header::decode(buf)?;
        let transactions = Vec::<Bytes>::decode(buf)?;
        Ok(Self { header, transactions, commit_sig: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64) -> Block {
        Block::new(
            Header {
                parent_hash: B256::repeat_byte(0xfe),
                number,
                timestamp: 1_700_000_000 + number,
                extra: Bytes::from_static(b"vrf"),
            },
            vec![Bytes::from_static(b"tx0"), Bytes::from_static(b"tx1")],
        )
    }

    #[test]
    fn block_rlp_roundtrip() {
        let original = block(42);
        let encoded = alloy_rlp::encode(&original);
        let decoded = Block::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.number(), 42);
    }

    #[test]
    fn commit_sig_not_encoded() {
        let mut signed = block(7);
        let unsigned = signed.clone();
        signed.set_commit_sig(Bytes::from_static(b"sig"));
        assert_eq!(alloy_rlp::encode(&signed), alloy_rlp::encode(&unsigned));
    }

    #[test]
    fn header_hash_commits_to_contents() {
        let a = block(1);
        let mut b = block(1);
        b.header.timestamp += 1;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), block(1).hash());
    }
}
