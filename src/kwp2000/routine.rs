//! Routine management wrapper for KWP2000

use super::{KwpClient, KwpCommand};
use crate::{DiagError, DiagResult};

/// Length of a partition digest
pub const DIGEST_LEN: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Routine Identifier
pub enum RoutineId {
    /// Erases the whole programmable flash
    EraseFlash,
    /// Erases a single partition, given its index
    ErasePartition,
    /// Computes the digest of a single partition, given its index
    PartitionDigest,
}

impl From<RoutineId> for u8 {
    fn from(id: RoutineId) -> Self {
        match id {
            RoutineId::EraseFlash => 0x52,
            RoutineId::ErasePartition => 0x53,
            RoutineId::PartitionDigest => 0x54,
        }
    }
}

/// Builds a 'start routine by local identifier' request
pub fn routine_request(id: RoutineId, args: &[u8]) -> Vec<u8> {
    let mut r = vec![KwpCommand::StartRoutineByLocalIdentifier.into(), id.into()];
    r.extend_from_slice(args);
    r
}

impl KwpClient {
    /// Starts a routine and waits for it to finish, returning the routine's result data
    pub fn kwp_start_routine(&mut self, id: RoutineId, args: &[u8]) -> DiagResult<Vec<u8>> {
        let mut res = self.request(&routine_request(id, args))?;
        match res.get(1) {
            Some(echo) if *echo == u8::from(id) => {
                res.drain(0..2);
                Ok(res)
            }
            Some(_) => Err(DiagError::WrongMessage),
            None => Err(DiagError::InvalidResponseLength),
        }
    }

    /// Asks the ECU for the digest of partition `index`
    pub fn kwp_partition_digest(&mut self, index: u8) -> DiagResult<[u8; DIGEST_LEN]> {
        let res = self.kwp_start_routine(RoutineId::PartitionDigest, &[index])?;
        match res.split_first() {
            Some((echo, digest)) if *echo == index && digest.len() == DIGEST_LEN => {
                let mut d = [0u8; DIGEST_LEN];
                d.copy_from_slice(digest);
                Ok(d)
            }
            Some((echo, _)) if *echo != index => Err(DiagError::WrongMessage),
            _ => Err(DiagError::InvalidResponseLength),
        }
    }
}
