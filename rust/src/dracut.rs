//! Sandboxed initramfs regeneration: build the dracut config as an
//! anonymous, sealed memory file and hand it to the child process as an
//! inherited descriptor rather than writing it into the checkout tree.

use crate::error::{Result, UpgraderError};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

/// The inherited fd number dracut's config is exposed on in the child.
const CONFIG_FD: i32 = 3;

/// Build a sealed, write-protected memfd holding a dracut config file
/// (one `--conf-dir`-style directive per `args` entry formatted as
/// `install_items+=" ... "`-equivalent raw dracut.conf.d lines).
pub fn build_config_memfd(lines: &[String]) -> Result<memfd::Memfd> {
    let memfd = memfd::MemfdOptions::default()
        .allow_sealing(true)
        .create("rpmostree-dracut-config")
        .map_err(|e| UpgraderError::io(format!("creating dracut config memfd: {e}")))?;

    {
        let mut file = memfd.as_file();
        for line in lines {
            writeln!(file, "{line}").map_err(|e| {
                UpgraderError::io(format!("writing dracut config memfd: {e}"))
            })?;
        }
    }

    memfd
        .add_seals(&[memfd::FileSeal::SealShrink, memfd::FileSeal::SealGrow, memfd::FileSeal::SealWrite])
        .map_err(|e| UpgraderError::io(format!("sealing dracut config memfd: {e}")))?;

    Ok(memfd)
}

/// Invoke `dracut` against `kver`/`initramfs_out` inside `rootfs`, passing
/// `config` as `/proc/self/fd/3` in the child rather than a path under the
/// checkout. `rootfs` becomes the child's working directory; the caller is
/// responsible for any chroot/namespace sandboxing beyond fd isolation.
pub fn run_dracut(rootfs: &Path, config: &memfd::Memfd, kver: &str, initramfs_out: &Path) -> Result<()> {
    let config_fd = config.as_file().as_raw_fd();

    let mut cmd = Command::new("dracut");
    cmd.current_dir(rootfs)
        .arg("--conf-dir")
        .arg(format!("/proc/self/fd/{CONFIG_FD}"))
        .arg("--kver")
        .arg(kver)
        .arg("--force")
        .arg(initramfs_out);

    unsafe {
        cmd.pre_exec(move || {
            if config_fd != CONFIG_FD {
                if libc::dup2(config_fd, CONFIG_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let status = cmd
        .status()
        .map_err(|e| UpgraderError::io(format!("spawning dracut: {e}")))?;
    if !status.success() {
        return Err(UpgraderError::integrity(format!(
            "dracut exited with {status} for kernel version '{kver}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn config_memfd_round_trips_content() {
        let memfd = build_config_memfd(&["add_dracutmodules+=\" overlayfs \"".to_string()]).unwrap();
        let mut file = memfd.as_file();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = String::new();
        file.read_to_string(&mut buf).unwrap();
        assert!(buf.contains("overlayfs"));
    }
}
