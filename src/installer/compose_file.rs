//! Compose-file manipulation used by the File Installer: rewriting the
//! `ports:` of a named service, and synthesizing a compose project that
//! wraps a bare script in a canonical runtime image.

use serde_yaml::Value;

use crate::errors::{Error, Result};

/// Rewrite `services.<service_name>.ports` to `ports`, preserving every
/// other field in the document (including unrelated services and keys).
pub fn rewrite_ports(yaml: &str, service_name: &str, ports: &[String]) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(yaml)?;

    let services = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::InvalidInput("compose file is not a mapping".into()))?
        .entry(Value::String("services".into()))
        .or_insert_with(|| Value::Mapping(Default::default()));

    let services_map = services
        .as_mapping_mut()
        .ok_or_else(|| Error::InvalidInput("compose 'services' is not a mapping".into()))?;

    let svc = services_map
        .get_mut(Value::String(service_name.to_string()))
        .ok_or_else(|| {
            Error::InvalidInput(format!("compose file has no service '{service_name}'"))
        })?;

    let svc_map = svc
        .as_mapping_mut()
        .ok_or_else(|| Error::InvalidInput(format!("service '{service_name}' is not a mapping")))?;

    let ports_value = Value::Sequence(ports.iter().map(|p| Value::String(p.clone())).collect());
    svc_map.insert(Value::String("ports".into()), ports_value);

    Ok(serde_yaml::to_string(&doc)?)
}

/// The canonical runtime images the synthetic wrapper compose project
/// uses for script kinds that require a container to execute.
pub fn runtime_image_for(kind: crate::installer::kind::Kind) -> Result<&'static str> {
    match kind {
        crate::installer::kind::Kind::TypeScript => Ok("node:22-slim"),
        crate::installer::kind::Kind::Python => Ok("python:3.12-slim"),
        other => Err(Error::InvalidInput(format!(
            "no canonical runtime image for kind {other}"
        ))),
    }
}

/// Build a synthetic compose project that runs `script_name` (bound
/// read-only into the container) under the canonical runtime image for
/// `kind`.
pub fn synth_wrapper_compose(
    service_name: &str,
    kind: crate::installer::kind::Kind,
    host_script_path: &str,
    script_name: &str,
) -> Result<String> {
    let image = runtime_image_for(kind)?;
    let entrypoint = match kind {
        crate::installer::kind::Kind::TypeScript => format!("node /app/{script_name}"),
        crate::installer::kind::Kind::Python => format!("python3 /app/{script_name}"),
        _ => unreachable!(),
    };

    Ok(format!(
        "services:\n  {service_name}:\n    image: {image}\n    command: [\"sh\", \"-c\", \"{entrypoint}\"]\n    volumes:\n      - \"{host_script_path}:/app/{script_name}:ro\"\n    restart: unless-stopped\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "services:\n  svc-a:\n    image: nginx:latest\n";

    #[test]
    fn rewrite_ports_preserves_other_fields() {
        let out = rewrite_ports(SAMPLE, "svc-a", &["8000:80".into(), "9000:90".into()]).unwrap();
        let doc: Value = serde_yaml::from_str(&out).unwrap();
        let svc = &doc["services"]["svc-a"];
        assert_eq!(svc["image"].as_str().unwrap(), "nginx:latest");
        let ports: Vec<&str> = svc["ports"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(ports, vec!["8000:80", "9000:90"]);
    }

    #[test]
    fn rewrite_ports_errors_on_missing_service() {
        assert!(rewrite_ports(SAMPLE, "svc-missing", &["80:80".into()]).is_err());
    }

    #[test]
    fn synth_wrapper_binds_script_read_only() {
        let out = synth_wrapper_compose(
            "svc-a",
            crate::installer::kind::Kind::Python,
            "/data/svc-a/script.py",
            "script.py",
        )
        .unwrap();
        assert!(out.contains("python:3.12-slim"));
        assert!(out.contains(":ro"));
    }
}
