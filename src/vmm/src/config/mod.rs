use std::convert::TryFrom;
use std::path::PathBuf;

const MAX_FIRMWARE_CODE_SIZE: u64 = 4 * 1024 * 1024;
const FIRMWARE_CODE_ALIGNMENT: u64 = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("firmware code file check error: {0}")]
    FirmwareCode(String),
    #[error("firmware vars file check error: {0}")]
    FirmwareVars(String),
    #[error("optional disk image file check error: {0}")]
    Disk(String),
    #[error("only a single vCPU is supported")]
    UnsupportedCpuCount,
}

/// Path to the firmware code image (`--fwcode`), validated to exist and to respect
/// the size/alignment constraints of the reset-vector shadow copy.
#[derive(Clone, Debug, PartialEq)]
pub struct FirmwareCodeConfig {
    pub path: PathBuf,
    pub size: u64,
}

impl TryFrom<String> for FirmwareCodeConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(value);
        let metadata = std::fs::metadata(&path)
            .map_err(|_| Error::FirmwareCode("file does not exist".to_string()))?;
        let size = metadata.len();

        if size == 0 || size % FIRMWARE_CODE_ALIGNMENT != 0 {
            return Err(Error::FirmwareCode(
                "size must be a non-zero multiple of 4 KiB".to_string(),
            ));
        }
        if size > MAX_FIRMWARE_CODE_SIZE {
            return Err(Error::FirmwareCode("size must not exceed 4 MiB".to_string()));
        }

        Ok(FirmwareCodeConfig { path, size })
    }
}

/// Path to the writable firmware-vars flash backing file (`--fwvars`).
#[derive(Clone, Debug, PartialEq)]
pub struct FirmwareVarsConfig {
    pub path: PathBuf,
}

impl TryFrom<String> for FirmwareVarsConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(value);
        if !path.exists() {
            return Err(Error::FirmwareVars("file does not exist".to_string()));
        }

        Ok(FirmwareVarsConfig { path })
    }
}

/// Optional `--disk`/`--optical` backing file, checked for existence only.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageConfig {
    pub path: PathBuf,
}

impl TryFrom<String> for ImageConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(value);
        if !path.exists() {
            return Err(Error::Disk("file does not exist".to_string()));
        }

        Ok(ImageConfig { path })
    }
}

/// Top-level VMM configuration, assembled from CLI flags.
#[derive(Debug)]
pub struct VMMConfig {
    pub fwcode: FirmwareCodeConfig,
    pub fwvars: FirmwareVarsConfig,
    pub disk: Option<ImageConfig>,
    pub optical: Option<ImageConfig>,
    pub memory_mb: u32,
    pub verbose: i32,
}

impl VMMConfig {
    pub fn new(
        fwcode: String,
        fwvars: String,
        disk: Option<String>,
        optical: Option<String>,
        cpus: u8,
        memory_mb: u32,
        verbose: i32,
    ) -> Result<Self, Error> {
        if cpus != 1 {
            return Err(Error::UnsupportedCpuCount);
        }

        Ok(VMMConfig {
            fwcode: FirmwareCodeConfig::try_from(fwcode)?,
            fwvars: FirmwareVarsConfig::try_from(fwvars)?,
            disk: disk.map(ImageConfig::try_from).transpose()?,
            optical: optical.map(ImageConfig::try_from).transpose()?,
            memory_mb,
            verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_try_from_fwvars() {
        let vars = FirmwareVarsConfig::try_from("./Cargo.toml".to_string());
        assert!(vars.is_ok());
    }

    #[test]
    fn test_fail_try_from_fwvars_missing() {
        let vars = FirmwareVarsConfig::try_from("./Cargo.tomle".to_string());
        assert!(vars.is_err());
    }

    #[test]
    fn test_fail_try_from_fwcode_bad_alignment() {
        // Cargo.toml is not a multiple of 4 KiB in the vast majority of cases.
        let code = FirmwareCodeConfig::try_from("./Cargo.toml".to_string());
        assert!(code.is_err());
    }

    #[test]
    fn test_fail_new_vmmconfig_multi_cpu() {
        let cfg = VMMConfig::new(
            "./Cargo.toml".to_string(),
            "./Cargo.toml".to_string(),
            None,
            None,
            2,
            256,
            0,
        );
        assert!(matches!(cfg.unwrap_err(), Error::UnsupportedCpuCount));
    }
}
