pub mod notification_service;
pub mod partner_service;
pub mod payment;
pub mod payment_service;
pub mod plan_service;
pub mod promo_service;
pub mod pubsub_service;
pub mod referral_service;
pub mod settings_service;
pub mod subscription_service;
pub mod user_service;

use rand::Rng;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random `A-Z0-9` code for referral links and generated promocodes.
pub fn random_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_the_upper_alphabet() {
        let code = random_code(10);
        assert_eq!(code.len(), 10);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }
}
