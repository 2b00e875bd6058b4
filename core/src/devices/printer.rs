//! SCSI printer (§4.10): spools PRINT data into a temp file, then hands it
//! to a host-configured command line on SYNCHRONIZE BUFFER.
//!
//! Grounded on `devices/scsi_printer.h`/`.cpp`.

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError};

const OPCODE_PRINT: u8 = 0x0a;
const OPCODE_SYNCHRONIZE_BUFFER: u8 = 0x10;
const OPCODE_STOP_PRINT: u8 = 0x1b;

pub const DEFAULT_PRINT_COMMAND: &str = "lp -oraw %f";

/// Spools PRINT payloads into a temp file (`$TMPDIR/rascsi_sclp-XXXXXX`) and
/// runs `print_command` (which must contain a `%f` placeholder) against it
/// on SYNCHRONIZE BUFFER.
pub struct Printer {
    print_command: String,
    spool_path: Option<PathBuf>,
    spool_file: Option<File>,
}

impl Printer {
    pub fn new(print_command: Option<String>) -> Self {
        Self {
            print_command: print_command.unwrap_or_else(|| DEFAULT_PRINT_COMMAND.to_string()),
            spool_path: None,
            spool_file: None,
        }
    }

    fn ensure_spool(&mut self) -> Result<()> {
        if self.spool_file.is_none() {
            let tmp = tempfile_spool()?;
            self.spool_path = Some(tmp.0);
            self.spool_file = Some(tmp.1);
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_spool()?;
        self.spool_file
            .as_mut()
            .expect("ensure_spool just populated it")
            .write_all(data)?;
        Ok(())
    }

    /// Runs `print_command` with `%f` substituted for the spool path, then
    /// deletes the spool file, regardless of the command's exit status.
    fn flush(&mut self) -> Result<()> {
        let Some(path) = self.spool_path.take() else {
            return Ok(());
        };
        self.spool_file = None;

        if !self.print_command.contains("%f") {
            anyhow::bail!("print command '{}' does not contain a %f placeholder", self.print_command);
        }
        let command = self.print_command.replace("%f", &path.to_string_lossy());
        let status = std::process::Command::new("sh").arg("-c").arg(&command).status();
        if let Err(e) = status {
            log::error!("failed to run print command '{command}': {e}");
        }
        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}

fn tempfile_spool() -> Result<(PathBuf, File)> {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("rascsi_sclp-{:06x}", std::process::id()));
    let file = File::create(&path).with_context(|| format!("creating spool file {}", path.display()))?;
    Ok((path, file))
}

impl ScsiTarget for Printer {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        match cdb[0] {
            OPCODE_PRINT => {
                let len = usize::from(cdb.get(4).copied().unwrap_or(0));
                match outdata {
                    None => Ok(CommandResult::DataOut(len)),
                    Some(data) => {
                        self.append(data)
                            .map_err(|_| dev.fail(ScsiError::illegal_request(Asc::WriteFault)))?;
                        Ok(CommandResult::Status(crate::error::status::GOOD))
                    }
                }
            }
            OPCODE_SYNCHRONIZE_BUFFER => {
                self.flush()
                    .map_err(|_| dev.fail(ScsiError::illegal_request(Asc::WriteFault)))?;
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_STOP_PRINT => self.test_unit_ready(dev).map(|()| CommandResult::Status(crate::error::status::GOOD)),
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidCommandOperationCode))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_then_synchronize_runs_command_against_spool() {
        let marker = std::env::temp_dir().join(format!("piscsi-printer-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);

        let mut printer = Printer::new(Some(format!("cp %f {}", marker.display())));
        let mut dev = Device::new(crate::device::DeviceType::Printer, 0);

        let cdb = [OPCODE_PRINT, 0, 0, 0, 5, 0];
        printer.dispatch(&mut dev, &cdb, None).unwrap();
        printer.dispatch(&mut dev, &cdb, Some(b"hello")).unwrap();

        let sync_cdb = [OPCODE_SYNCHRONIZE_BUFFER, 0, 0, 0, 0, 0];
        printer.dispatch(&mut dev, &sync_cdb, None).unwrap();

        let contents = std::fs::read(&marker).expect("print command should have produced the marker file");
        assert_eq!(contents, b"hello");
        let _ = std::fs::remove_file(&marker);
    }

    #[test]
    fn missing_percent_f_is_rejected() {
        let mut printer = Printer::new(Some("lp -oraw".to_string()));
        let mut dev = Device::new(crate::device::DeviceType::Printer, 0);
        let cdb = [OPCODE_PRINT, 0, 0, 0, 3, 0];
        printer.dispatch(&mut dev, &cdb, None).unwrap();
        printer.dispatch(&mut dev, &cdb, Some(b"abc")).unwrap();

        let sync_cdb = [OPCODE_SYNCHRONIZE_BUFFER, 0, 0, 0, 0, 0];
        assert!(printer.dispatch(&mut dev, &sync_cdb, None).is_err());
    }
}
