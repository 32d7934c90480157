// Copyright (c) 2017-2018 Rene van der Meer
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
// THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::gpio::{Edge, Error, Result};

/// Default location of the sysfs GPIO interface.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

// Freshly exported pins start off owned by root:root, and udev needs some time
// to hand them over to the gpio group. Retry opening the direction file for
// max. 1s before giving up.
const DIRECTION_RETRIES: u32 = 100;
const DIRECTION_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Directions accepted by a pin's sysfs `direction` file.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    // Control files are written including the terminating NUL byte.
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Direction::In => b"in\0",
            Direction::Out => b"out\0",
        }
    }
}

/// Location and timing configuration for the sysfs GPIO interface.
///
/// `Sysfs` only knows how to read and write the control files. Keeping track of
/// which step a pin has reached is up to [`GpioPort`].
///
/// [`GpioPort`]: struct.GpioPort.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysfs {
    root: PathBuf,
    direction_retries: u32,
    direction_retry_delay: Duration,
}

impl Default for Sysfs {
    fn default() -> Sysfs {
        Sysfs::new()
    }
}

impl Sysfs {
    /// Constructs a new `Sysfs` rooted at `/sys/class/gpio`.
    pub fn new() -> Sysfs {
        Sysfs::with_root(SYSFS_GPIO_ROOT)
    }

    /// Constructs a new `Sysfs` rooted at `root`.
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Sysfs {
        Sysfs {
            root: root.into(),
            direction_retries: DIRECTION_RETRIES,
            direction_retry_delay: DIRECTION_RETRY_DELAY,
        }
    }

    /// Returns the root directory of the sysfs GPIO interface.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configures how often, and with what delay in between, opening a pin's
    /// `direction` file is attempted before giving up with
    /// [`Error::PermissionTimeout`].
    ///
    /// By default, `retries` is set to `100`, and `delay` to 10 ms.
    ///
    /// [`Error::PermissionTimeout`]: enum.Error.html#variant.PermissionTimeout
    pub fn set_direction_retries(&mut self, retries: u32, delay: Duration) {
        self.direction_retries = retries.max(1);
        self.direction_retry_delay = delay;
    }

    /// Returns the path of the directory sysfs creates for an exported pin.
    pub fn pin_path(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    /// Returns `true` if the pin's sysfs directory exists.
    pub fn is_exported(&self, pin: u8) -> bool {
        self.pin_path(pin).exists()
    }

    /// Exports the pin, unless it's already exported.
    pub fn export(&self, pin: u8) -> Result<()> {
        // Exporting a pin twice fails with EBUSY
        if self.is_exported(pin) {
            return Ok(());
        }

        write_control(&self.root.join("export"), pin.to_string().as_bytes())?;
        debug!("Exported pin {}", pin);

        Ok(())
    }

    /// Unexports the pin.
    pub fn unexport(&self, pin: u8) -> Result<()> {
        write_control(&self.root.join("unexport"), pin.to_string().as_bytes())?;
        debug!("Unexported pin {}", pin);

        Ok(())
    }

    /// Writes the pin's `direction` file, waiting for it to become writable.
    pub fn set_direction(&self, pin: u8, direction: Direction) -> Result<()> {
        let path = self.pin_path(pin).join("direction");

        let mut attempt = 0;
        let mut file = loop {
            match OpenOptions::new().write(true).open(&path) {
                Ok(file) => break file,
                Err(_) if attempt + 1 < self.direction_retries => {
                    attempt += 1;
                    thread::sleep(self.direction_retry_delay);
                }
                Err(e) => {
                    debug!(
                        "Giving up on {} after {} attempts: {}",
                        path.display(),
                        self.direction_retries,
                        e
                    );
                    return Err(Error::PermissionTimeout(pin));
                }
            }
        };

        if attempt > 0 {
            debug!("Opened {} after {} retries", path.display(), attempt);
        }

        write_all_once(&mut file, &path, direction.as_bytes())?;
        debug!("Set pin {} direction to {:?}", pin, direction);

        Ok(())
    }

    /// Writes the pin's `edge` file.
    pub fn set_edge(&self, pin: u8, edge: Edge) -> Result<()> {
        let mut buffer = Vec::with_capacity(8);
        buffer.extend_from_slice(edge.as_str().as_bytes());
        buffer.push(0);

        write_control(&self.pin_path(pin).join("edge"), &buffer)?;
        debug!("Set pin {} edge to {}", pin, edge);

        Ok(())
    }

    /// Opens the pin's `value` file as a read-only, non-blocking readiness
    /// descriptor.
    pub fn open_value(&self, pin: u8) -> Result<File> {
        let path = self.pin_path(pin).join("value");

        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| Error::ResourceUnavailable(path, e))
    }
}

fn write_control(path: &Path, buffer: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::ResourceUnavailable(path.to_path_buf(), e))?;

    write_all_once(&mut file, path, buffer)
}

// sysfs handles each write() as a single command, so a short write can't be
// completed by writing the remainder.
fn write_all_once(file: &mut File, path: &Path, buffer: &[u8]) -> Result<()> {
    let written = file
        .write(buffer)
        .map_err(|e| Error::ResourceUnavailable(path.to_path_buf(), e))?;

    if written != buffer.len() {
        return Err(Error::PartialWrite(written, buffer.len()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::io::AsRawFd;

    use tempfile::TempDir;

    fn sysfs_tree() -> (TempDir, Sysfs) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("export"), b"").unwrap();
        fs::write(dir.path().join("unexport"), b"").unwrap();

        let mut sysfs = Sysfs::with_root(dir.path());
        sysfs.set_direction_retries(3, Duration::from_millis(1));

        (dir, sysfs)
    }

    fn create_pin(dir: &TempDir, pin: u8) {
        let pin_dir = dir.path().join(format!("gpio{}", pin));
        fs::create_dir(&pin_dir).unwrap();
        for name in &["direction", "edge", "value"] {
            fs::write(pin_dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn export_skips_exported_pin() {
        let (dir, sysfs) = sysfs_tree();
        create_pin(&dir, 17);

        sysfs.export(17).unwrap();
        sysfs.export(17).unwrap();

        assert_eq!(fs::read(dir.path().join("export")).unwrap(), b"");
    }

    #[test]
    fn export_writes_pin_number() {
        let (dir, sysfs) = sysfs_tree();

        sysfs.export(23).unwrap();

        assert_eq!(fs::read(dir.path().join("export")).unwrap(), b"23");
    }

    #[test]
    fn export_without_control_file() {
        let dir = TempDir::new().unwrap();
        let sysfs = Sysfs::with_root(dir.path());

        match sysfs.export(4) {
            Err(Error::ResourceUnavailable(path, _)) => assert_eq!(path, dir.path().join("export")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn unexport_writes_pin_number() {
        let (dir, sysfs) = sysfs_tree();

        sysfs.unexport(5).unwrap();

        assert_eq!(fs::read(dir.path().join("unexport")).unwrap(), b"5");
    }

    #[test]
    fn direction_includes_terminator() {
        let (dir, sysfs) = sysfs_tree();
        create_pin(&dir, 17);

        sysfs.set_direction(17, Direction::Out).unwrap();
        assert_eq!(fs::read(dir.path().join("gpio17/direction")).unwrap(), b"out\0");

        sysfs.set_direction(17, Direction::In).unwrap();
        assert_eq!(&fs::read(dir.path().join("gpio17/direction")).unwrap()[..3], b"in\0");
    }

    #[test]
    fn direction_times_out() {
        let (_dir, sysfs) = sysfs_tree();

        match sysfs.set_direction(6, Direction::In) {
            Err(Error::PermissionTimeout(6)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn edge_names() {
        let (dir, sysfs) = sysfs_tree();
        create_pin(&dir, 17);

        sysfs.set_edge(17, Edge::Falling).unwrap();

        assert_eq!(fs::read(dir.path().join("gpio17/edge")).unwrap(), b"falling\0");
    }

    #[test]
    fn value_is_non_blocking() {
        let (dir, sysfs) = sysfs_tree();
        create_pin(&dir, 17);

        let value = sysfs.open_value(17).unwrap();
        let flags = unsafe { libc::fcntl(value.as_raw_fd(), libc::F_GETFL) };

        assert_ne!(flags & libc::O_NONBLOCK, 0);
        assert_eq!(flags & libc::O_ACCMODE, libc::O_RDONLY);
    }
}
