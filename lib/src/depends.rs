//! Depends resolver (component C5, spec §4.5): checks an incoming
//! artifact's depends against the device's current provides, and
//! applies the clears-then-merge commit rule.

use anyhow::Result;

use crate::artifact::header::{Header, TypeInfo};
use crate::error::EngineError;
use crate::store::Provides;

/// Check rules, in order, fatal on first failure (spec §4.5 steps 1-4).
pub fn check(header: &Header, device_type: &str, current: &Provides) -> Result<()> {
    let depends = &header.header_info.depends;

    if !depends.device_type.iter().any(|d| d == device_type) {
        anyhow::bail!(EngineError::DeviceTypeMismatch);
    }

    if let Some(names) = &depends.artifact_name {
        if !names.iter().any(|n| n == &current.artifact_name) {
            anyhow::bail!(EngineError::ArtifactNameMismatch);
        }
    }

    if let Some(groups) = &depends.artifact_group {
        let matches = current
            .artifact_group
            .as_ref()
            .map(|g| groups.iter().any(|want| want == g))
            .unwrap_or(false);
        if !matches {
            anyhow::bail!(EngineError::ArtifactGroupMismatch);
        }
    }

    for sub in &header.sub_headers {
        check_type_info_depends(&sub.type_info, current)?;
    }

    Ok(())
}

fn check_type_info_depends(type_info: &TypeInfo, current: &Provides) -> Result<()> {
    for (key, value) in &type_info.artifact_depends {
        match current.get(key) {
            Some(actual) if actual == value => {}
            _ => anyhow::bail!(EngineError::DependsUnsatisfied(key.clone())),
        }
    }
    Ok(())
}

/// Apply the commit-time clears-then-merge rule for one payload's
/// sub-header (spec §4.5 commit rules 1-3), mutating `provides` in
/// place. Rule 3 (overwriting `artifact_name`/`artifact_group`) is
/// applied once per artifact by the caller, not per sub-header.
pub fn apply_commit(provides: &mut Provides, type_info: &TypeInfo) -> Result<()> {
    provides.apply_clears(&type_info.clears_artifact_provides)?;
    provides.merge(&type_info.artifact_provides);
    Ok(())
}

/// Rule 3: overwrite `artifact_name`, and `artifact_group` if present
/// else delete it.
pub fn apply_identity(provides: &mut Provides, header: &Header) {
    provides.artifact_name = header.header_info.provides.artifact_name.clone();
    provides.artifact_group = header.header_info.provides.artifact_group.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::header::{DependsDecl, HeaderInfo, ProvidesDecl, SubHeader};
    use std::collections::BTreeMap;

    fn header_with_device_types(types: Vec<&str>) -> Header {
        Header {
            header_info: HeaderInfo {
                payloads: vec![],
                provides: ProvidesDecl::default(),
                depends: DependsDecl {
                    device_type: types.into_iter().map(String::from).collect(),
                    artifact_name: None,
                    artifact_group: None,
                },
            },
            scripts: vec![],
            sub_headers: vec![],
        }
    }

    #[test]
    fn device_type_mismatch_is_fatal() {
        let header = header_with_device_types(vec!["other-device"]);
        let provides = Provides::default();
        let err = check(&header, "my-device", &provides).unwrap_err();
        assert!(err.to_string().contains("device type"));
    }

    #[test]
    fn absent_group_never_matches_a_required_group() {
        let mut header = header_with_device_types(vec!["my-device"]);
        header.header_info.depends.artifact_group = Some(vec!["group-a".into()]);
        let provides = Provides::default();
        assert!(check(&header, "my-device", &provides).is_err());
    }

    #[test]
    fn sub_header_depends_checked_against_provides() {
        let mut header = header_with_device_types(vec!["my-device"]);
        let mut type_info = TypeInfo::default();
        type_info.artifact_depends.insert("rootfs-image.checksum".into(), "abc".into());
        header.sub_headers.push(SubHeader { type_info, meta_data: None });
        let mut provides = Provides::default();
        assert!(check(&header, "my-device", &provides).is_err());
        provides.extra.insert("rootfs-image.checksum".into(), "abc".into());
        assert!(check(&header, "my-device", &provides).is_ok());
    }

    #[test]
    fn commit_clears_then_merges_in_order() {
        let mut provides = Provides::default();
        provides.extra.insert("rootfs-image.version".into(), "1".into());
        let mut type_info = TypeInfo::default();
        type_info.clears_artifact_provides.push("rootfs-image.*".to_string());
        type_info.artifact_provides = BTreeMap::from([("rootfs-image.checksum".to_string(), "def".to_string())]);
        apply_commit(&mut provides, &type_info).unwrap();
        assert_eq!(provides.extra.get("rootfs-image.version"), None);
        assert_eq!(provides.extra.get("rootfs-image.checksum"), Some(&"def".to_string()));
    }
}
