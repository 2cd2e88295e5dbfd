use bip39::Mnemonic;
use rand::RngCore;
use zeroize::Zeroize;

/// Generate a BIP-39 mnemonic of 12 or 24 words from OS entropy.
pub fn generate_mnemonic(words: usize) -> anyhow::Result<String> {
    let len = match words {
        12 => 16, // 128 bits
        24 => 32, // 256 bits
        other => anyhow::bail!("unsupported word count {other}, use 12 or 24"),
    };
    let mut entropy = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut entropy[..len]);
    let mnemonic = Mnemonic::from_entropy(&entropy[..len])
        .map_err(|e| anyhow::anyhow!("mnemonic generation failed: {e}"));
    entropy.zeroize();
    Ok(mnemonic?.to_string())
}

/// Check word list and checksum before a phrase goes to the wallet.
pub fn validate_mnemonic(phrase: &str) -> anyhow::Result<()> {
    let _: Mnemonic = phrase
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid mnemonic: {e}"))?;
    Ok(())
}
