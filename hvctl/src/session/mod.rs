//! Seams to the hypervisor's remote object model.
//!
//! A [`ManagementSession`] executes queries, creates instances, and invokes
//! methods against the management namespace. A method invocation returns a
//! numeric code and, for long-running operations, a [`JobHandle`] that the
//! [`crate::job`] module polls to completion.
//!
//! Both traits are async seams in the style of subprocess controllers:
//! production implementations talk to the real endpoint, tests script them.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{HvError, HvResult};
use crate::job::JobState;

/// Management namespace for the v2 virtualization object model.
pub const HYPERV_NAMESPACE: &str = r"root\virtualization\v2";

pub const VIRTUAL_SYSTEM_MANAGEMENT_SERVICE: &str = "Msvm_VirtualSystemManagementService";
pub const IMAGE_MANAGEMENT_SERVICE: &str = "Msvm_ImageManagementService";

/// Loosely-typed property bag used for instance fields and method arguments.
pub type Fields = Map<String, Value>;

/// Path identifying one object inside the management namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote object: its path plus the properties read alongside it.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    pub path: ObjectPath,
    pub properties: Fields,
}

impl ObjectHandle {
    pub fn new(path: ObjectPath, properties: Fields) -> Self {
        Self { path, properties }
    }

    /// Deserialize the property bag into a typed view.
    pub fn deserialize<T: DeserializeOwned>(&self) -> HvResult<T> {
        serde_json::from_value(Value::Object(self.properties.clone()))
            .map_err(|e| HvError::Internal(format!("malformed object properties: {}", e)))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }

    /// Textual serialization of the instance, suitable for passing as an
    /// embedded-instance method argument (e.g. `SystemSettings`,
    /// `VirtualDiskSettingData`).
    pub fn embedded_text(&self) -> String {
        Value::Object(self.properties.clone()).to_string()
    }
}

/// Result of one method invocation: the synchronous return code, the pending
/// job handle when the operation is still running, and any output fields.
pub struct MethodOutput {
    pub return_code: i32,
    pub job: Option<Box<dyn JobHandle>>,
    pub out_fields: Fields,
}

/// Connection to the hypervisor's management endpoint.
///
/// The session may be shared across callers (`Arc<dyn ManagementSession>`);
/// nothing in this crate mutates it.
#[async_trait]
pub trait ManagementSession: Send + Sync {
    /// Execute a WQL query and return the matching objects.
    async fn query(&self, wql: &str) -> HvResult<Vec<ObjectHandle>>;

    /// Create a new instance of the named class with the given fields.
    async fn create_instance(&self, class_name: &str, fields: &Fields) -> HvResult<ObjectHandle>;

    /// Invoke a method on the target object.
    async fn invoke_method(
        &self,
        target: &ObjectPath,
        method: &str,
        args: &Fields,
    ) -> HvResult<MethodOutput>;
}

/// A pending long-running operation.
///
/// The handle is exclusively owned by the single in-flight resolve call.
/// State reads are strictly sequential, and `release` consumes the handle so
/// a double release is unrepresentable.
#[async_trait]
pub trait JobHandle: Send {
    /// Read the job's current state.
    async fn state(&mut self) -> HvResult<JobState>;

    /// Read the numeric error code, if the job exposes one.
    async fn error_code(&mut self) -> HvResult<Option<i32>>;

    /// Read the human-readable error description, if the job exposes one.
    /// Also carries non-fatal warning text on jobs that completed with
    /// warnings.
    async fn error_description(&mut self) -> HvResult<Option<String>>;

    /// Release the handle. Called exactly once, on every outcome branch.
    async fn release(self: Box<Self>) -> HvResult<()>;
}

/// Fetch the single instance of a singleton service class.
pub async fn singleton_instance(
    session: &dyn ManagementSession,
    class_name: &str,
) -> HvResult<ObjectHandle> {
    let wql = format!("Select * From {}", class_name);
    let mut handles = session.query(&wql).await?;
    if handles.is_empty() {
        return Err(HvError::Session(format!(
            "no instance of singleton class {}",
            class_name
        )));
    }
    Ok(handles.swap_remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn handle_with(fields: &[(&str, Value)]) -> ObjectHandle {
        let mut properties = Fields::new();
        for (k, v) in fields {
            properties.insert(k.to_string(), v.clone());
        }
        ObjectHandle::new(ObjectPath::new("test:path"), properties)
    }

    #[test]
    fn test_deserialize_typed_view() {
        #[derive(Deserialize)]
        struct View {
            #[serde(rename = "ElementName")]
            name: String,
        }

        let handle = handle_with(&[("ElementName", json!("vm-1"))]);
        let view: View = handle.deserialize().unwrap();
        assert_eq!(view.name, "vm-1");
    }

    #[test]
    fn test_get_str() {
        let handle = handle_with(&[("Path", json!("C:\\disk.vhdx")), ("Format", json!(3))]);
        assert_eq!(handle.get_str("Path"), Some("C:\\disk.vhdx"));
        assert_eq!(handle.get_str("Format"), None);
        assert_eq!(handle.get_str("Missing"), None);
    }

    #[test]
    fn test_embedded_text_round_trips_fields() {
        let handle = handle_with(&[("MaxInternalSize", json!(1073741824u64))]);
        let text = handle.embedded_text();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["MaxInternalSize"], json!(1073741824u64));
    }
}
