//! Virtual disk creation and resizing.
//!
//! Creation goes through the image management service and delegates the
//! resulting job to [`crate::job`]. Resizing shells out to the platform's
//! `Resize-VHD` utility, which is synchronous and has no job semantics.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{HvError, HvResult};
use crate::job::{self, PollSettings};
use crate::session::{Fields, IMAGE_MANAGEMENT_SERVICE, ManagementSession, singleton_instance};

const DISK_SETTINGS_CLASS: &str = "Msvm_VirtualHardDiskSettingData";

// Msvm_VirtualHardDiskSettingData constants: VHDX format, dynamic type.
const DISK_FORMAT_VHDX: u16 = 3;
const DISK_TYPE_DYNAMIC: u16 = 3;

/// Strongly typed disk size in gibibytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GiB(pub u64);

impl GiB {
    pub fn to_bytes(self) -> u64 {
        self.0 << 30
    }
}

impl std::fmt::Display for GiB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}GiB", self.0)
    }
}

/// Settings instance describing the disk to create.
#[derive(Debug, Serialize)]
struct VhdSettings {
    #[serde(rename = "Format")]
    format: u16,
    #[serde(rename = "Type")]
    disk_type: u16,
    #[serde(rename = "MaxInternalSize")]
    max_internal_size: u64,
    #[serde(rename = "Path")]
    path: String,
}

impl VhdSettings {
    fn fields(&self) -> HvResult<Fields> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err(HvError::Internal(
                "disk settings did not serialize to an object".to_string(),
            )),
            Err(e) => Err(HvError::Internal(format!(
                "could not serialize disk settings: {}",
                e
            ))),
        }
    }
}

/// Thin manager over the session for disk-level operations.
#[derive(Clone)]
pub struct DiskManager {
    session: Arc<dyn ManagementSession>,
    poll: PollSettings,
}

impl DiskManager {
    pub fn new(session: Arc<dyn ManagementSession>) -> Self {
        Self::with_settings(session, PollSettings::default())
    }

    pub fn with_settings(session: Arc<dyn ManagementSession>, poll: PollSettings) -> Self {
        Self { session, poll }
    }

    /// Create a dynamic VHDX at `path` with the given maximum size.
    pub async fn create_vhdx(&self, path: &Path, max_size: GiB) -> HvResult<()> {
        let settings = VhdSettings {
            format: DISK_FORMAT_VHDX,
            disk_type: DISK_TYPE_DYNAMIC,
            max_internal_size: max_size.to_bytes(),
            path: path.display().to_string(),
        };
        let instance = self
            .session
            .create_instance(DISK_SETTINGS_CLASS, &settings.fields()?)
            .await?;

        let service =
            singleton_instance(self.session.as_ref(), IMAGE_MANAGEMENT_SERVICE).await?;

        let mut args = Fields::new();
        args.insert(
            "VirtualDiskSettingData".to_string(),
            Value::String(instance.embedded_text()),
        );
        let output = self
            .session
            .invoke_method(&service.path, "CreateVirtualHardDisk", &args)
            .await?;

        tracing::debug!(
            path = %path.display(),
            size = %max_size,
            return_code = output.return_code,
            "CreateVirtualHardDisk invoked"
        );
        let outcome = job::resolve(output.return_code, output.job, &self.poll).await;
        outcome.into_operation("create vhdx")
    }
}

/// Resize a disk image to `new_size` using the external resize utility.
///
/// There is no local guard against shrinking a disk below its current size;
/// validation is left entirely to the utility.
pub async fn resize_disk(disk_path: &Path, new_size: GiB) -> HvResult<()> {
    let command = format!("Resize-VHD {} {}", disk_path.display(), new_size.to_bytes());
    tracing::debug!(command = %command, "resizing disk image");

    let status = tokio::process::Command::new("powershell")
        .arg("-command")
        .arg(&command)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| HvError::Command(format!("unable to run resize utility: {}", e)))?;

    if !status.success() {
        return Err(HvError::Command(format!(
            "unable to resize disk image {}: {}",
            disk_path.display(),
            status
        )));
    }
    Ok(())
}
