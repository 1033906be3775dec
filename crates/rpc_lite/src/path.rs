use crate::error::MethodPathError;

/// A parsed method path: `{package}.{service}/{method}`
///
/// Example: `user.User/Ping`
/// - `package`: `user`
/// - `service`: `User`
/// - `method`: `Ping`
///
/// Registered names are not required to be paths; this is only used to
/// split fully-qualified names for logging and span attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodPath {
    pub package: String,
    pub service: String,
    pub method: String,
}

impl MethodPath {
    /// Parse a method path string.
    ///
    /// Expected format: `{package}.{service}/{method}`, with an optional
    /// leading slash.
    pub fn parse(path: &str) -> Result<Self, MethodPathError> {
        let path = path.strip_prefix('/').unwrap_or(path);

        let (service_path, method) = path.rsplit_once('/').ok_or_else(|| {
            MethodPathError::Invalid(format!("method path must contain '/': '{path}'"))
        })?;

        let (package, service) = service_path.rsplit_once('.').ok_or_else(|| {
            MethodPathError::Invalid(format!(
                "service path must contain package.service: '{service_path}'"
            ))
        })?;

        if package.is_empty() || service.is_empty() || method.is_empty() {
            return Err(MethodPathError::Invalid(format!(
                "package, service, and method must all be non-empty: '{path}'"
            )));
        }

        Ok(MethodPath {
            package: package.to_owned(),
            service: service.to_owned(),
            method: method.to_owned(),
        })
    }

    /// Returns the full service name: `{package}.{service}`
    pub fn full_service(&self) -> String {
        format!("{}.{}", self.package, self.service)
    }

    /// Returns the full method path: `{package}.{service}/{method}`
    pub fn full_path(&self) -> String {
        format!("{}.{}/{}", self.package, self.service, self.method)
    }
}

/// Split a registered name into `(service, method)` for logging.
///
/// Names that are not fully qualified are reported with an empty service.
pub fn split_method_name(name: &str) -> (String, String) {
    match MethodPath::parse(name) {
        Ok(path) => (path.full_service(), path.method),
        Err(_) => (String::new(), name.trim_start_matches('/').to_string()),
    }
}
