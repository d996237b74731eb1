// src/utils/mod.rs
use ethers::types::U256;
use ethers::utils::format_units;
use log::info;

pub fn setup_logging() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("ethers_providers", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    info!("Logging initialized.");
    Ok(())
}

/// Human-readable base-unit amount for logs and CLI output.
pub fn display_amount(amount: U256, decimals: u8) -> String {
    format_units(amount, u32::from(decimals)).unwrap_or_else(|_| amount.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_amount_scales_by_decimals() {
        assert_eq!(
            display_amount(U256::from(1_500_000_000u64), 9),
            "1.500000000"
        );
    }
}
