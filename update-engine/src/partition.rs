//! Writing payload images to the passive bank.
//!
//! Banks are block devices or volume files, one per slot. Capacity is
//! checked before a single byte is written so that an oversized image
//! never clobbers a bank. Volume-backed banks declare their exact write
//! size up front; a shorter write leaves the volume corrupted, which is an
//! expected and recoverable condition (the next attempt simply rewrites
//! it), surfaced as its own error variant.

use std::{
    fs::OpenOptions,
    io::{self, Read, Seek, SeekFrom, Write as _},
    path::PathBuf,
};

use ab_update_engine_core::Slot;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed opening bank at `{}`", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed writing bank at `{}`", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "image of {needed} bytes exceeds bank capacity of {available} bytes at `{}`",
        path.display()
    )]
    Capacity {
        path: PathBuf,
        needed: u64,
        available: u64,
    },
    #[error(
        "volume at `{}` received {written} of {expected} declared bytes and is \
         now corrupted; rewriting it will recover",
        path.display()
    )]
    VolumeUnderWrite {
        path: PathBuf,
        expected: u64,
        written: u64,
    },
}

/// How a bank is backed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BankKind {
    /// A raw block device or file; writes may be shorter than the bank.
    Raw,
    /// A volume whose declared write size must be delivered in full.
    Volume,
}

/// One bank as configured for this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankConfig {
    pub path: PathBuf,
    pub kind: BankKind,
    /// Capacity override; when absent the current size of the backing
    /// file or device is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    /// Value of the boot environment's boot-part variable that makes the
    /// firmware boot this bank.
    pub boot_part: String,
}

#[derive(Debug, Clone)]
pub struct PartitionManager {
    bank_a: BankConfig,
    bank_b: BankConfig,
}

impl PartitionManager {
    pub fn new(bank_a: BankConfig, bank_b: BankConfig) -> Self {
        Self { bank_a, bank_b }
    }

    pub fn bank(&self, slot: Slot) -> &BankConfig {
        match slot {
            Slot::A => &self.bank_a,
            Slot::B => &self.bank_b,
        }
    }

    /// Maps a boot-part value back to the slot it boots.
    pub fn slot_for_boot_part(&self, boot_part: &str) -> Option<Slot> {
        if self.bank_a.boot_part == boot_part {
            Some(Slot::A)
        } else if self.bank_b.boot_part == boot_part {
            Some(Slot::B)
        } else {
            None
        }
    }

    /// Streams `len` bytes from `reader` into the bank of `slot`.
    ///
    /// Fails with [`Error::Capacity`] before writing anything when the
    /// image cannot fit.
    pub fn write(
        &self,
        slot: Slot,
        reader: &mut impl Read,
        len: u64,
    ) -> Result<(), Error> {
        let bank = self.bank(slot);
        let open_err = |source| Error::Open {
            path: bank.path.clone(),
            source,
        };
        let write_err = |source| Error::Write {
            path: bank.path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .read(true)
            .open(&bank.path)
            .map_err(open_err)?;
        let available = match bank.capacity {
            Some(capacity) => capacity,
            None => {
                let end = file.seek(SeekFrom::End(0)).map_err(open_err)?;
                file.seek(SeekFrom::Start(0)).map_err(open_err)?;
                end
            }
        };
        if len > available {
            return Err(Error::Capacity {
                path: bank.path.clone(),
                needed: len,
                available,
            });
        }

        info!(slot = %slot, path = %bank.path.display(), len, "writing image to bank");
        let written =
            io::copy(&mut reader.take(len), &mut file).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        if written < len && bank.kind == BankKind::Volume {
            warn!(
                slot = %slot,
                expected = len,
                written,
                "volume under-written, bank marked corrupted until rewritten"
            );
            return Err(Error::VolumeUnderWrite {
                path: bank.path.clone(),
                expected: len,
                written,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn bank(path: PathBuf, kind: BankKind, boot_part: &str) -> BankConfig {
        BankConfig {
            path,
            kind,
            capacity: None,
            boot_part: boot_part.to_string(),
        }
    }

    fn manager(tmp: &TempDir, kind: BankKind, size: usize) -> PartitionManager {
        let a = tmp.path().join("bank_a");
        let b = tmp.path().join("bank_b");
        fs::write(&a, vec![0u8; size]).unwrap();
        fs::write(&b, vec![0u8; size]).unwrap();
        PartitionManager::new(bank(a, kind, "2"), bank(b, kind, "3"))
    }

    #[test]
    fn writes_the_image_into_the_requested_bank() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, BankKind::Raw, 32);
        let image = b"new rootfs";
        manager
            .write(Slot::B, &mut &image[..], image.len() as u64)
            .unwrap();
        let bank_b = fs::read(tmp.path().join("bank_b")).unwrap();
        assert_eq!(&bank_b[..image.len()], image);
        // The other bank is untouched.
        assert_eq!(fs::read(tmp.path().join("bank_a")).unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn oversized_image_fails_before_any_write() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, BankKind::Raw, 8);
        let image = vec![1u8; 64];
        let err = manager
            .write(Slot::B, &mut &image[..], image.len() as u64)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity {
                needed: 64,
                available: 8,
                ..
            }
        ));
        assert_eq!(fs::read(tmp.path().join("bank_b")).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn capacity_override_takes_precedence_over_file_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bank_a");
        fs::write(&path, vec![0u8; 64]).unwrap();
        let mut cfg = bank(path, BankKind::Raw, "2");
        cfg.capacity = Some(4);
        let manager = PartitionManager::new(
            cfg,
            bank(tmp.path().join("bank_b"), BankKind::Raw, "3"),
        );
        let image = vec![1u8; 16];
        let err = manager.write(Slot::A, &mut &image[..], 16).unwrap_err();
        assert!(matches!(err, Error::Capacity { available: 4, .. }));
    }

    #[test]
    fn volume_under_write_is_a_recoverable_corruption() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, BankKind::Volume, 32);
        // Declare more bytes than the reader will deliver.
        let image = b"short";
        let err = manager.write(Slot::B, &mut &image[..], 16).unwrap_err();
        assert!(matches!(
            err,
            Error::VolumeUnderWrite {
                expected: 16,
                written: 5,
                ..
            }
        ));
        // A full rewrite recovers the bank.
        let full = vec![7u8; 16];
        manager.write(Slot::B, &mut &full[..], 16).unwrap();
    }

    #[test]
    fn raw_bank_tolerates_a_short_reader() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, BankKind::Raw, 32);
        let image = b"short";
        manager.write(Slot::B, &mut &image[..], 16).unwrap();
    }

    #[test]
    fn boot_part_maps_back_to_slots() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, BankKind::Raw, 8);
        assert_eq!(manager.slot_for_boot_part("2"), Some(Slot::A));
        assert_eq!(manager.slot_for_boot_part("3"), Some(Slot::B));
        assert_eq!(manager.slot_for_boot_part("9"), None);
    }
}
