/// Base units in one coin
pub const COIN: u64 = 100_000_000;

pub fn format_token_amount(amount: u128, decimals: u32) -> String {
	let scale = 10u128.pow(decimals);
	if decimals == 0 {
		return amount.to_string();
	}
	format!(
		"{}.{:0width$}",
		amount / scale,
		amount % scale,
		width = decimals as usize
	)
}

/// Format base units as coins with eight decimals.
pub fn format_amount(amount: u64) -> String {
	format_token_amount(amount as u128, 8)
}

/// Convert a fee rate from coin per kilobyte, as servers report it, to base
/// units per virtual byte.
pub fn coin_per_kb_to_sat_per_vbyte(fee: f64) -> f64 {
	fee * COIN as f64 / 1000.0
}
