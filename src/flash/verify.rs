//! Verification of written flash

use super::{DigestProvider, InlineKeepAlive};
use crate::{
    firmware::{
        FirmwareImage, Partition, BLOCK_BASE, FINAL_BLOCK_INDEX, FINAL_BLOCK_LEN, RAW_BLOCK_LEN,
    },
    session::SessionManager,
    DiagError, DiagResult,
};

/// Reads `len` bytes of flash from `address`, `chunk` bytes per request
pub fn read_flash(
    session: &mut SessionManager,
    address: u32,
    len: u32,
    chunk: u8,
) -> DiagResult<Vec<u8>> {
    if chunk == 0 {
        return Err(DiagError::ParameterInvalid);
    }
    let _stall = session.stall();
    let mut keep_alive = InlineKeepAlive::new(session);
    let mut out = Vec::with_capacity(len as usize);
    let mut offset = 0u32;
    while offset < len {
        let n = (len - offset).min(chunk as u32) as u8;
        let data = session.client().kwp_read_memory(address + offset, n)?;
        out.extend_from_slice(&data);
        offset += n as u32;
        keep_alive.tick(session)?;
    }
    Ok(out)
}

fn written_len(count: u32) -> u32 {
    if count > FINAL_BLOCK_INDEX {
        FINAL_BLOCK_INDEX * RAW_BLOCK_LEN + FINAL_BLOCK_LEN
    } else {
        count * RAW_BLOCK_LEN
    }
}

/// Reads back the first `count` blocks and returns the indexes of blocks which differ from the image
pub fn verify_blocks(
    session: &mut SessionManager,
    image: &FirmwareImage,
    count: u32,
    chunk: u8,
) -> DiagResult<Vec<u32>> {
    let len = written_len(count);
    let expected = image
        .data()
        .get(BLOCK_BASE as usize..(BLOCK_BASE + len) as usize)
        .ok_or(DiagError::ParameterInvalid)?;
    let actual = read_flash(session, BLOCK_BASE, len, chunk)?;
    let mismatched: Vec<u32> = expected
        .chunks(RAW_BLOCK_LEN as usize)
        .zip(actual.chunks(RAW_BLOCK_LEN as usize))
        .enumerate()
        .filter(|(_, (e, a))| e != a)
        .map(|(i, _)| i as u32)
        .collect();
    if !mismatched.is_empty() {
        log::error!("{} block(s) differ from the image: {mismatched:?}", mismatched.len());
    }
    Ok(mismatched)
}

/// Compares ECU side partition digests with digests of the image.
/// Returns the indexes of partitions which differ
pub fn verify_partitions(
    session: &mut SessionManager,
    image: &FirmwareImage,
    partitions: &[Partition],
    digest: &dyn DigestProvider,
) -> DiagResult<Vec<u8>> {
    let mut mismatched = Vec::new();
    for p in partitions {
        let data = p.slice(image).ok_or(DiagError::ParameterInvalid)?;
        let expected = digest.digest(data);
        let actual = session.client().kwp_partition_digest(p.index)?;
        if expected != actual {
            log::error!(
                "Partition {} digest mismatch. Expected {expected:02X?}, ECU reports {actual:02X?}",
                p.index
            );
            mismatched.push(p.index);
        }
        session.send_keep_alive()?;
    }
    Ok(mismatched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_length() {
        assert_eq!(written_len(20), 20 * 0xEA);
        assert_eq!(BLOCK_BASE + written_len(FINAL_BLOCK_INDEX + 1), 0x100000);
    }
}
