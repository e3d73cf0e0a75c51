//! Uploading and starting the flash bootloader

use super::{Collaborators, FlashOptions, Phase, PhaseExt, WorkflowError, WorkflowErrorKind};
use crate::{
    kwp2000::{SecurityLevel, MAX_TRANSFER_DATA},
    progress::ActivityKind,
    session::SessionManager,
    DiagError, DiagResult,
};

/// RAM address the bootloader is loaded to and started from
pub const BOOTLOADER_ADDRESS: u32 = 0x102400;

/// Downloads `bootloader` to RAM at `address` and starts it.
///
/// The session must have requested programming. On success the session is in the
/// bootloader state, with no security level granted.
pub fn upload(session: &mut SessionManager, bootloader: &[u8], address: u32) -> DiagResult<()> {
    if bootloader.is_empty() {
        return Err(DiagError::ParameterInvalid);
    }
    let _stall = session.stall();
    log::info!(
        "Uploading {} byte bootloader to 0x{address:06X}",
        bootloader.len()
    );
    session
        .client()
        .kwp_request_download(address, bootloader.len() as u32)?;
    for (n, chunk) in bootloader.chunks(MAX_TRANSFER_DATA).enumerate() {
        let chunk_address = address + (n * MAX_TRANSFER_DATA) as u32;
        session.client().kwp_transfer_data(chunk_address, chunk)?;
        session.send_keep_alive()?;
    }
    session.client().kwp_execute(address)?;
    session.mark_bootloader_active()
}

/// Brings an ECU running its application to an authenticated bootloader session
pub fn establish_bootloader(
    session: &mut SessionManager,
    bootloader: &[u8],
    opts: &FlashOptions,
    c: &Collaborators<'_>,
) -> Result<(), WorkflowError> {
    c.progress
        .on_activity("Starting programming session".into(), ActivityKind::Phase);
    session.start_extended_session().phase(Phase::Session)?;
    session
        .disable_normal_communication()
        .phase(Phase::Session)?;
    session
        .request_access(SecurityLevel::Level01, c.keys, opts.security_delay)
        .phase(Phase::Security)?;

    c.progress
        .on_activity("Uploading bootloader".into(), ActivityKind::Phase);
    upload(session, bootloader, opts.bootloader_address)
        .map_err(|e| {
            WorkflowError::new(Phase::Bootloader, WorkflowErrorKind::BootloaderUpload(e))
        })?;

    session
        .request_access(opts.bootloader_level, c.keys, opts.security_delay)
        .phase(Phase::Security)?;
    Ok(())
}
