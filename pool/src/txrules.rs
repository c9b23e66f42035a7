//! Transaction sizing and fee rules for payout transactions.
//!
//! The payout transaction only ever spends coinbase outputs to P2PKH
//! recipients, so sizing works from fixed worst-case script sizes rather
//! than concrete scripts.

/// Number of atoms in one coin.
pub const ATOMS_PER_COIN: i64 = 100_000_000;

/// Default minimum relay fee, in atoms per kilobyte of serialized
/// transaction.
pub const DEFAULT_RELAY_FEE_PER_KB: i64 = 10_000;

/// Worst-case size of a signature script redeeming a P2PKH output:
/// a push of a 73-byte DER signature plus a push of a 33-byte compressed
/// public key.
pub const REDEEM_P2PKH_SIG_SCRIPT_SIZE: usize = 1 + 73 + 1 + 33;

/// Serialized size of a P2PKH transaction output: 8-byte value, 2-byte
/// script version, script length varint and the 25-byte script itself.
pub const P2PKH_OUTPUT_SIZE: usize = 8 + 2 + 1 + 25;

/// Overhead added to an output's script size when testing for dust,
/// accounting for the bytes needed to later redeem it.
const DUST_INPUT_OVERHEAD: usize = 165;

/// Serialized size of a variable-length integer encoding `n`.
pub fn var_int_serialize_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Estimated serialized size of a transaction input with the provided
/// signature script size: 32-byte prevout hash, 4-byte index, 1-byte
/// tree, 8-byte value, 4-byte block height, 4-byte block index, script
/// length varint and the script itself.
fn estimate_input_size(script_size: usize) -> usize {
    32 + 4 + 1 + 8 + 4 + 4 + var_int_serialize_size(script_size as u64) + script_size
}

/// Estimated serialized size of a transaction output with the provided
/// script size.
fn estimate_output_size(script_size: usize) -> usize {
    8 + 2 + var_int_serialize_size(script_size as u64) + script_size
}

/// Estimates the serialized size of a transaction from per-input
/// signature script sizes and per-output script sizes. A change script
/// size of zero means no change output.
pub fn estimate_serialize_size_from_script_sizes(
    input_sizes: &[usize],
    output_sizes: &[usize],
    change_script_size: usize,
) -> usize {
    let ins: usize = input_sizes
        .iter()
        .map(|size| estimate_input_size(*size))
        .sum();
    let outs: usize = output_sizes
        .iter()
        .map(|size| estimate_output_size(*size))
        .sum();
    let mut output_count = output_sizes.len();
    let mut change = 0;
    if change_script_size > 0 {
        change = estimate_output_size(change_script_size);
        output_count += 1;
    }

    // 12 additional bytes cover the version, locktime and expiry fields.
    12 + 2 * var_int_serialize_size(input_sizes.len() as u64)
        + var_int_serialize_size(output_count as u64)
        + ins
        + outs
        + change
}

/// Calculates the fee for a transaction of the provided serialized size,
/// never returning less than the relay fee itself for a non-empty
/// transaction.
pub fn fee_for_serialize_size(relay_fee_per_kb: i64, size: usize) -> i64 {
    let fee = relay_fee_per_kb * size as i64 / 1000;
    if fee == 0 && relay_fee_per_kb > 0 {
        return relay_fee_per_kb;
    }
    fee
}

/// Reports whether an output of the provided amount and serialized size
/// would be considered dust at the given relay fee rate, i.e. whether
/// relaying it costs more than a third of its value.
pub fn is_dust_amount(amount: i64, output_size: usize, relay_fee_per_kb: i64) -> bool {
    let total_size = (output_size + DUST_INPUT_OVERHEAD) as i64;
    amount * 1000 / (3 * total_size) < relay_fee_per_kb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_sizes() {
        assert_eq!(var_int_serialize_size(0), 1);
        assert_eq!(var_int_serialize_size(0xfc), 1);
        assert_eq!(var_int_serialize_size(0xfd), 3);
        assert_eq!(var_int_serialize_size(0xffff), 3);
        assert_eq!(var_int_serialize_size(0x10000), 5);
        assert_eq!(var_int_serialize_size(u64::MAX), 9);
    }

    #[test]
    fn dust_threshold_for_p2pkh() {
        // Threshold for a standard P2PKH output at the default relay fee:
        // 3 * (36 + 165) * 10 = 6030 atoms.
        assert!(is_dust_amount(6029, P2PKH_OUTPUT_SIZE, DEFAULT_RELAY_FEE_PER_KB));
        assert!(!is_dust_amount(6030, P2PKH_OUTPUT_SIZE, DEFAULT_RELAY_FEE_PER_KB));
        assert!(is_dust_amount(990, P2PKH_OUTPUT_SIZE, DEFAULT_RELAY_FEE_PER_KB));
    }

    #[test]
    fn fee_scales_with_size() {
        assert_eq!(fee_for_serialize_size(DEFAULT_RELAY_FEE_PER_KB, 1000), 10_000);
        assert_eq!(fee_for_serialize_size(DEFAULT_RELAY_FEE_PER_KB, 271), 2710);
        // A size small enough to round to zero still pays the relay fee.
        assert_eq!(fee_for_serialize_size(DEFAULT_RELAY_FEE_PER_KB, 0), 10_000);
    }

    #[test]
    fn single_input_two_output_estimate() {
        let size = estimate_serialize_size_from_script_sizes(
            &[REDEEM_P2PKH_SIG_SCRIPT_SIZE],
            &[P2PKH_OUTPUT_SIZE, P2PKH_OUTPUT_SIZE],
            0,
        );
        // 12 + 2*1 + 1 + 162 + 2*47 = 271.
        assert_eq!(size, 271);
    }
}
