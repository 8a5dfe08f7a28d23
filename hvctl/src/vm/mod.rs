//! Virtual machine enumeration, lookup, and definition.
//!
//! Every operation here is one query or one method invocation against the
//! management session; any pending result delegates to [`crate::job`] for
//! completion tracking. No state is kept between calls.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{HvError, HvResult};
use crate::job::{self, PollSettings};
use crate::session::{
    Fields, ManagementSession, ObjectPath, VIRTUAL_SYSTEM_MANAGEMENT_SERVICE, singleton_instance,
};

const VM_QUERY: &str = "Select * From Msvm_ComputerSystem Where Caption = 'Virtual Machine'";
const VM_SETTINGS_CLASS: &str = "Msvm_VirtualSystemSettingData";

/// Typed view of a `Msvm_ComputerSystem` instance.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachine {
    /// Hypervisor-assigned identifier (a GUID in the `Name` property).
    #[serde(rename = "Name", default)]
    pub id: String,
    /// User-visible machine name.
    #[serde(rename = "ElementName", default)]
    pub name: String,
    #[serde(rename = "EnabledState", default)]
    pub enabled_state: u16,
    /// Object path the instance was read from.
    #[serde(skip)]
    pub path: ObjectPath,
}

/// Thin manager over the session for machine-level operations.
#[derive(Clone)]
pub struct VirtualMachineManager {
    session: Arc<dyn ManagementSession>,
    poll: PollSettings,
}

impl VirtualMachineManager {
    pub fn new(session: Arc<dyn ManagementSession>) -> Self {
        Self::with_settings(session, PollSettings::default())
    }

    pub fn with_settings(session: Arc<dyn ManagementSession>, poll: PollSettings) -> Self {
        Self { session, poll }
    }

    /// Enumerate all virtual machines.
    pub async fn list(&self) -> HvResult<Vec<VirtualMachine>> {
        let handles = self.session.query(VM_QUERY).await?;
        let mut vms = Vec::with_capacity(handles.len());
        for handle in &handles {
            let mut vm: VirtualMachine = handle.deserialize()?;
            vm.path = handle.path.clone();
            vms.push(vm);
        }
        Ok(vms)
    }

    /// Check whether a machine with the given name exists.
    ///
    /// Name comparison is exact and case-sensitive.
    pub async fn exists(&self, name: &str) -> HvResult<bool> {
        let vms = self.list().await?;
        Ok(vms.iter().any(|vm| vm.name == name))
    }

    /// Look up a machine by its user-visible name.
    ///
    /// Name comparison is exact and case-sensitive. If several machines
    /// share the name, the first enumeration hit wins.
    pub async fn get(&self, name: &str) -> HvResult<VirtualMachine> {
        let wql = format!("{} And ElementName='{}'", VM_QUERY, name);
        let handles = self.session.query(&wql).await?;
        let handle = handles
            .first()
            .ok_or_else(|| HvError::NotFound(name.to_string()))?;
        let mut vm: VirtualMachine = handle.deserialize()?;
        vm.path = handle.path.clone();
        Ok(vm)
    }

    /// Define a new machine with the given name.
    ///
    /// Builds a settings instance, invokes `DefineSystem` on the management
    /// service, and drives any resulting job to completion.
    pub async fn define(&self, name: &str) -> HvResult<()> {
        let mut fields = Fields::new();
        fields.insert("ElementName".to_string(), Value::String(name.to_string()));
        let settings = self.session.create_instance(VM_SETTINGS_CLASS, &fields).await?;

        let service =
            singleton_instance(self.session.as_ref(), VIRTUAL_SYSTEM_MANAGEMENT_SERVICE).await?;

        let mut args = Fields::new();
        args.insert(
            "SystemSettings".to_string(),
            Value::String(settings.embedded_text()),
        );
        let output = self
            .session
            .invoke_method(&service.path, "DefineSystem", &args)
            .await?;

        tracing::debug!(name, return_code = output.return_code, "DefineSystem invoked");
        let outcome = job::resolve(output.return_code, output.job, &self.poll).await;
        outcome.into_operation(&format!("define system {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{JobHandle, MethodOutput, ObjectHandle};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted session: serves a fixed machine list for queries (honoring
    /// the `ElementName='..'` filter) and pops pre-canned method outputs.
    struct FakeSession {
        vms: Vec<ObjectHandle>,
        outputs: Mutex<VecDeque<MethodOutput>>,
    }

    impl FakeSession {
        fn with_vms(names: &[&str]) -> Self {
            let vms = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let mut fields = Fields::new();
                    fields.insert("Name".to_string(), json!(format!("guid-{}", i)));
                    fields.insert("ElementName".to_string(), json!(name));
                    fields.insert("EnabledState".to_string(), json!(2));
                    ObjectHandle::new(ObjectPath::new(format!("vm:{}", name)), fields)
                })
                .collect();
            Self {
                vms,
                outputs: Mutex::new(VecDeque::new()),
            }
        }

        fn push_output(&self, return_code: i32, job: Option<Box<dyn JobHandle>>) {
            self.outputs.lock().unwrap().push_back(MethodOutput {
                return_code,
                job,
                out_fields: Fields::new(),
            });
        }
    }

    #[async_trait]
    impl ManagementSession for FakeSession {
        async fn query(&self, wql: &str) -> HvResult<Vec<ObjectHandle>> {
            if let Some(rest) = wql.split("ElementName='").nth(1) {
                let name = rest.trim_end_matches('\'');
                return Ok(self
                    .vms
                    .iter()
                    .filter(|h| h.get_str("ElementName") == Some(name))
                    .cloned()
                    .collect());
            }
            if wql.contains(VIRTUAL_SYSTEM_MANAGEMENT_SERVICE) {
                return Ok(vec![ObjectHandle::new(
                    ObjectPath::new("service:vsms"),
                    Fields::new(),
                )]);
            }
            Ok(self.vms.clone())
        }

        async fn create_instance(
            &self,
            _class_name: &str,
            fields: &Fields,
        ) -> HvResult<ObjectHandle> {
            Ok(ObjectHandle::new(
                ObjectPath::new("instance:settings"),
                fields.clone(),
            ))
        }

        async fn invoke_method(
            &self,
            _target: &ObjectPath,
            _method: &str,
            _args: &Fields,
        ) -> HvResult<MethodOutput> {
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| HvError::Internal("no scripted method output".to_string()))
        }
    }

    fn manager(session: FakeSession) -> VirtualMachineManager {
        VirtualMachineManager::new(Arc::new(session))
    }

    #[tokio::test]
    async fn test_list_returns_all_machines() {
        let manager = manager(FakeSession::with_vms(&["alpha", "beta"]));
        let vms = manager.list().await.unwrap();
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].name, "alpha");
        assert_eq!(vms[0].id, "guid-0");
        assert_eq!(vms[1].path, ObjectPath::new("vm:beta"));
    }

    #[tokio::test]
    async fn test_exists_is_exact_and_case_sensitive() {
        let manager = manager(FakeSession::with_vms(&["alpha"]));
        assert!(manager.exists("alpha").await.unwrap());
        assert!(!manager.exists("Alpha").await.unwrap());
        assert!(!manager.exists("alph").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_by_name() {
        let manager = manager(FakeSession::with_vms(&["alpha", "beta"]));
        let vm = manager.get("beta").await.unwrap();
        assert_eq!(vm.name, "beta");
        assert_eq!(vm.id, "guid-1");
    }

    #[tokio::test]
    async fn test_get_missing_machine_is_not_found() {
        let manager = manager(FakeSession::with_vms(&["alpha"]));
        let err = manager.get("gamma").await.unwrap_err();
        assert!(matches!(err, HvError::NotFound(name) if name == "gamma"));
    }

    #[tokio::test]
    async fn test_define_succeeds_on_completed_return_code() {
        let session = FakeSession::with_vms(&[]);
        session.push_output(job::RET_COMPLETED, None);
        let manager = manager(session);
        manager.define("new-vm").await.unwrap();
    }

    #[tokio::test]
    async fn test_define_failure_preserves_return_code() {
        let session = FakeSession::with_vms(&[]);
        session.push_output(32770, None);
        let manager = manager(session);
        let err = manager.define("new-vm").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("define system new-vm"));
        assert!(message.contains("32770"), "message was: {}", message);
    }
}
