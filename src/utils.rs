//! Naming helpers shared by device variants

use crate::{Error, Result};

/// Upper bound on identifiers handed to the hypervisor.
pub const MAX_DEV_ID_SIZE: usize = 31;

/// Highest index addressable as SCSI id:lun.
const MAX_SCSI_DEVICES: u32 = 65535;

/// Linux DISK_NAME_LEN
const DISK_NAME_LEN: usize = 32;
const VIRT_DRIVE_PREFIX: &str = "vd";

/// Build `"{kind}-{id}"`, truncated to at most `max_len` bytes.
pub fn make_name_id(kind: &str, id: &str, max_len: usize) -> String {
    let mut name = format!("{}-{}", kind, id);
    if name.len() > max_len {
        let mut cut = max_len;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

/// Predict the guest name of the virtio-blk disk at `index`.
///
/// `0 -> vda`, `25 -> vdz`, `26 -> vdaa`.
pub fn virt_drive_name(index: u32) -> Result<String> {
    let max_letters = DISK_NAME_LEN - VIRT_DRIVE_PREFIX.len();
    let mut letters = Vec::with_capacity(4);
    let mut rest = i64::from(index);

    while rest >= 0 {
        if letters.len() == max_letters {
            return Err(Error::AllocationFailure(format!(
                "block index {} has no drive name",
                index
            )));
        }
        letters.push(b'a' + (rest % 26) as u8);
        rest = rest / 26 - 1;
    }

    letters.reverse();
    let suffix = String::from_utf8(letters).unwrap_or_default();
    Ok(format!("{}{}", VIRT_DRIVE_PREFIX, suffix))
}

/// SCSI `"id:lun"` address for a block index.
pub fn scsi_address(index: u32) -> Result<String> {
    if index > MAX_SCSI_DEVICES {
        return Err(Error::AllocationFailure(format!(
            "block index {} exceeds SCSI limit {}",
            index, MAX_SCSI_DEVICES
        )));
    }
    Ok(format!("{}:{}", index / 256, index % 256))
}
