//! ABI word decoding for the handful of events the collector understands.

use common::providers::rpc::word_to_address;
use common::types::{normalize_address, RawLog};

pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
pub const UNIV2_SWAP_TOPIC: &str = "0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822";
pub const UNIV3_SWAP_TOPIC: &str = "0xc42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67";

/// One 32-byte word from an ABI-encoded payload.
fn word(data: &str, index: usize) -> Option<[u8; 32]> {
    let hex_str = data.trim_start_matches("0x");
    let start = index * 64;
    let chunk = hex_str.get(start..start + 64)?;
    let mut out = [0_u8; 32];
    hex::decode_to_slice(chunk, &mut out).ok()?;
    Some(out)
}

/// Unsigned word; `None` when the value does not fit in 128 bits.
fn word_u128(data: &str, index: usize) -> Option<u128> {
    let w = word(data, index)?;
    if w[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let mut low = [0_u8; 16];
    low.copy_from_slice(&w[16..]);
    Some(u128::from_be_bytes(low))
}

/// Two's-complement `int256`; `None` when outside the `i128` range.
fn word_i128(data: &str, index: usize) -> Option<i128> {
    let w = word(data, index)?;
    let negative = w[0] & 0x80 != 0;
    let fill = if negative { 0xff } else { 0x00 };
    if w[..16].iter().any(|b| *b != fill) {
        return None;
    }
    let mut low = [0_u8; 16];
    low.copy_from_slice(&w[16..]);
    let v = i128::from_be_bytes(low);
    // sign of the low half must agree with the extension
    if (v < 0) != negative {
        return None;
    }
    Some(v)
}

fn topic_address(log: &RawLog, index: usize) -> Option<String> {
    log.topics.get(index).and_then(|t| word_to_address(t))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub token: String,
    pub from: String,
    pub to: String,
    pub amount: u128,
}

/// ERC-20 `Transfer(address indexed, address indexed, uint256)`. ERC-721
/// transfers carry the id as a fourth topic and are ignored.
pub fn decode_transfer(log: &RawLog) -> Option<DecodedTransfer> {
    if log.topics.len() != 3 || !log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
        return None;
    }
    Some(DecodedTransfer {
        token: normalize_address(&log.address),
        from: topic_address(log, 1)?,
        to: topic_address(log, 2)?,
        amount: word_u128(&log.data, 0)?,
    })
}

/// Pool-relative swap: which side of the pair went in and which came out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSwap {
    pub recipient: String,
    /// `true` when token0 was paid into the pool.
    pub token0_in: bool,
    pub amount_in: u128,
    pub amount_out: u128,
}

/// Uniswap V2 `Swap(sender, amount0In, amount1In, amount0Out, amount1Out, to)`.
pub fn decode_v2_swap(log: &RawLog) -> Option<DecodedSwap> {
    if !log.topics.first()?.eq_ignore_ascii_case(UNIV2_SWAP_TOPIC) {
        return None;
    }
    let a0_in = word_u128(&log.data, 0)?;
    let a1_in = word_u128(&log.data, 1)?;
    let a0_out = word_u128(&log.data, 2)?;
    let a1_out = word_u128(&log.data, 3)?;
    let recipient = topic_address(log, 2)?;

    let token0_in = a0_in > 0;
    let (amount_in, amount_out) = if token0_in { (a0_in, a1_out) } else { (a1_in, a0_out) };
    Some(DecodedSwap {
        recipient,
        token0_in,
        amount_in,
        amount_out,
    })
}

/// Uniswap V3 `Swap(sender, recipient, int256 amount0, int256 amount1, ...)`.
/// Positive amounts flow into the pool.
pub fn decode_v3_swap(log: &RawLog) -> Option<DecodedSwap> {
    if !log.topics.first()?.eq_ignore_ascii_case(UNIV3_SWAP_TOPIC) {
        return None;
    }
    let amount0 = word_i128(&log.data, 0)?;
    let amount1 = word_i128(&log.data, 1)?;
    let recipient = topic_address(log, 2)?;

    let token0_in = amount0 > 0;
    let (amount_in, amount_out) = if token0_in {
        (amount0.unsigned_abs(), amount1.unsigned_abs())
    } else {
        (amount1.unsigned_abs(), amount0.unsigned_abs())
    };
    Some(DecodedSwap {
        recipient,
        token0_in,
        amount_in,
        amount_out,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn topic_for(address: &str) -> String {
        format!("0x{:0>64}", address.trim_start_matches("0x"))
    }

    pub(crate) fn uint_word(v: u128) -> String {
        format!("{v:064x}")
    }

    pub(crate) fn int_word(v: i128) -> String {
        if v < 0 {
            format!("{}{:032x}", "f".repeat(32), v)
        } else {
            format!("{v:064x}")
        }
    }

    fn log(topics: Vec<String>, data: String) -> RawLog {
        RawLog {
            address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
            topics,
            data,
            block_number: 1,
            tx_hash: "0xabc".to_string(),
            log_index: 0,
        }
    }

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn test_decode_erc20_transfer() {
        let l = log(
            vec![TRANSFER_TOPIC.to_string(), topic_for(ALICE), topic_for(BOB)],
            format!("0x{}", uint_word(5_000_000)),
        );
        let t = decode_transfer(&l).unwrap();
        assert_eq!(t.token, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(t.from, ALICE);
        assert_eq!(t.to, BOB);
        assert_eq!(t.amount, 5_000_000);
    }

    #[test]
    fn test_erc721_transfer_is_ignored() {
        let l = log(
            vec![
                TRANSFER_TOPIC.to_string(),
                topic_for(ALICE),
                topic_for(BOB),
                uint_word(7),
            ],
            "0x".to_string(),
        );
        assert!(decode_transfer(&l).is_none());
    }

    #[test]
    fn test_decode_v2_swap_token1_in() {
        let data = format!(
            "0x{}{}{}{}",
            uint_word(0),
            uint_word(2_000),
            uint_word(1_500),
            uint_word(0)
        );
        let l = log(
            vec![UNIV2_SWAP_TOPIC.to_string(), topic_for(ALICE), topic_for(BOB)],
            data,
        );
        let s = decode_v2_swap(&l).unwrap();
        assert!(!s.token0_in);
        assert_eq!(s.amount_in, 2_000);
        assert_eq!(s.amount_out, 1_500);
        assert_eq!(s.recipient, BOB);
    }

    #[test]
    fn test_decode_v3_swap_signed_amounts() {
        let data = format!("0x{}{}", int_word(1_000), int_word(-990));
        let l = log(
            vec![UNIV3_SWAP_TOPIC.to_string(), topic_for(ALICE), topic_for(BOB)],
            data,
        );
        let s = decode_v3_swap(&l).unwrap();
        assert!(s.token0_in);
        assert_eq!(s.amount_in, 1_000);
        assert_eq!(s.amount_out, 990);
    }

    #[test]
    fn test_word_i128_rejects_bad_sign_extension() {
        let data = format!("{}{:032x}", "0".repeat(31) + "1", 5_u128);
        assert!(word_i128(&data, 0).is_none());
        assert_eq!(word_i128(&int_word(-1), 0), Some(-1));
    }

    #[test]
    fn test_wrong_topic_or_short_data() {
        let l = log(vec![UNIV2_SWAP_TOPIC.to_string()], "0x00".to_string());
        assert!(decode_v3_swap(&l).is_none());
        assert!(decode_v2_swap(&l).is_none());
    }
}
