#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use trionic_flash::{
    config::FlashConfig,
    firmware::{EcuVariant, FirmwareImage, LAST_ADDRESS_OFFSET},
    flash::{Collaborators, DigestProvider},
    hardware::simulation::{sample_digest, sample_key, SimulatedEcu},
    progress::LogProgress,
    session::SessionManager,
};

pub struct SampleDigest;

impl DigestProvider for SampleDigest {
    fn digest(&self, data: &[u8]) -> [u8; 16] {
        sample_digest(data)
    }

    fn write_sidecar_hash(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let hex: String = sample_digest(data).iter().map(|b| format!("{b:02x}")).collect();
        std::fs::write(path.with_extension("hash"), hex)
    }
}

pub static DIGEST: SampleDigest = SampleDigest;
pub static PROGRESS: LogProgress = LogProgress;

pub fn collaborators() -> Collaborators<'static> {
    Collaborators {
        keys: &sample_key,
        digest: &DIGEST,
        progress: &PROGRESS,
    }
}

/// Configuration with short timeouts, suitable for the simulated ECU
pub fn fast_config() -> FlashConfig {
    FlashConfig::from_pairs([
        ("read_timeout_ms", "300"),
        ("flow_control_timeout_ms", "300"),
        ("busy_delay_ms", "5"),
        ("erase_timeout_ms", "5000"),
        ("erase_inactivity_ms", "2000"),
    ])
    .unwrap()
}

pub fn connect(ecu: &Arc<SimulatedEcu>, cfg: &FlashConfig) -> SessionManager {
    let _ = env_logger::try_init();
    cfg.connect(ecu.clone()).unwrap()
}

/// Image of `variant` filled with a pattern that never contains 0xFF
pub fn pattern_image(variant: EcuVariant) -> Vec<u8> {
    (0..variant.image_len()).map(|i| (i % 251) as u8).collect()
}

/// T8 image whose last used address pointer is `last_used`
pub fn t8_image(last_used: u32) -> FirmwareImage {
    let mut data = pattern_image(EcuVariant::T8);
    data[LAST_ADDRESS_OFFSET..LAST_ADDRESS_OFFSET + 3]
        .copy_from_slice(&last_used.to_be_bytes()[1..]);
    FirmwareImage::from_bytes(data).unwrap()
}

pub fn bootloader() -> Vec<u8> {
    (0..0x300u32).map(|i| (i * 3) as u8).collect()
}

pub fn temp_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trionic_flash_{}_{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

/// Position of the first request matching `pred` at or after `from`
pub fn position_from(
    requests: &[Vec<u8>],
    from: usize,
    pred: impl Fn(&[u8]) -> bool,
) -> Option<usize> {
    requests[from..].iter().position(|r| pred(r)).map(|p| p + from)
}
