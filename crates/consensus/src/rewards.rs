//! Block subsidy schedule.

use crate::constants::{HF_CHAIN_REWARD_END_HEIGHT, HF_REWARD_DECLINE_START_HEIGHT};
use crate::money::{Amount, COIN};

const INITIAL_REWARD_COINS: i64 = 5_000;

/// Coin-seconds numerator of the declining era: 5000 * 143500.
const DECLINE_NUMERATOR: i64 = INITIAL_REWARD_COINS * HF_REWARD_DECLINE_START_HEIGHT as i64;

/// The amount a coinbase may claim at `height`, excluding fees.
///
/// Flat 5000 coins through the first era, then a hyperbolic decline of
/// `round(5000 * 143500 / (height + 1))` coins until the reward end
/// height. Genesis and the post-reward era pay nothing.
pub fn block_subsidy(height: i32) -> Amount {
    if height == 0 || height > HF_CHAIN_REWARD_END_HEIGHT {
        return 0;
    }
    if height < HF_REWARD_DECLINE_START_HEIGHT {
        return INITIAL_REWARD_COINS * COIN;
    }
    let divisor = height as i64 + 1;
    // floor(0.5 + n/d) without going through floating point.
    let coins = (2 * DECLINE_NUMERATOR + divisor) / (2 * divisor);
    coins * COIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_pays_nothing() {
        assert_eq!(block_subsidy(0), 0);
    }

    #[test]
    fn first_era_is_flat() {
        assert_eq!(block_subsidy(1), 5_000 * COIN);
        assert_eq!(block_subsidy(143_499), 5_000 * COIN);
    }

    #[test]
    fn decline_starts_at_the_boundary() {
        assert_eq!(block_subsidy(143_500), 5_000 * COIN);
        assert_eq!(block_subsidy(286_999), 2_500 * COIN);
        assert!(block_subsidy(1_000_000) < block_subsidy(500_000));
    }

    #[test]
    fn reward_era_ends() {
        assert_eq!(block_subsidy(HF_CHAIN_REWARD_END_HEIGHT), COIN);
        assert_eq!(block_subsidy(HF_CHAIN_REWARD_END_HEIGHT + 1), 0);
    }

    #[test]
    fn declining_reward_rounds_to_nearest() {
        // 5000 * 143500 / 200000 = 3587.5, rounds up.
        assert_eq!(block_subsidy(199_999), 3_588 * COIN);
    }
}
