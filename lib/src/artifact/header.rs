//! Header data model (spec §3 "Header").

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::metadata::MetaValue;

/// One entry of `header-info.payloads[]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadDecl {
    /// `rootfs-image`, `module-image`, or `empty`.
    #[serde(rename = "type")]
    pub payload_type: String,
    /// Human-readable payload name.
    pub name: String,
}

/// `header-info.provides`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvidesDecl {
    /// Required, non-empty.
    pub artifact_name: String,
    /// Optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<String>,
}

/// `header-info.depends`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependsDecl {
    /// Required, non-empty.
    pub device_type: Vec<String>,
    /// Optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<Vec<String>>,
    /// Optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<Vec<String>>,
}

/// `header-info` top-level JSON object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Ordered payload declarations.
    pub payloads: Vec<PayloadDecl>,
    /// This artifact's own provides.
    pub provides: ProvidesDecl,
    /// What this artifact requires of the device it's installed on.
    pub depends: DependsDecl,
}

impl HeaderInfo {
    /// Validate the non-empty-string/set invariants from spec §3.
    pub fn validate(&self) -> Result<()> {
        if self.provides.artifact_name.is_empty() {
            return Err(anyhow!("header-info: provides.artifact_name must be non-empty"));
        }
        if self.depends.device_type.is_empty() {
            return Err(anyhow!("header-info: depends.device_type must be non-empty"));
        }
        Ok(())
    }
}

/// `headers/NNNN/type-info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeInfo {
    /// Must match the corresponding `header-info.payloads[i].payload_type`
    /// when that is not empty.
    #[serde(rename = "type")]
    pub payload_type: String,
    /// Flat string->string provides this payload contributes on commit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_provides: BTreeMap<String, String>,
    /// Flat string->string provides this payload requires to be installed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_depends: BTreeMap<String, String>,
    /// Ordered glob patterns cleared from the provides store before merge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clears_artifact_provides: Vec<String>,
}

impl TypeInfo {
    /// Per spec §9's open-question resolution: an empty clear pattern is
    /// rejected outright rather than silently treated as match-nothing.
    pub fn validate(&self) -> Result<()> {
        if self.clears_artifact_provides.iter().any(|p| p.is_empty()) {
            return Err(anyhow!(
                "type-info: clears_artifact_provides may not contain an empty pattern"
            ));
        }
        Ok(())
    }
}

/// One `headers/NNNN/` pair (`type-info` plus optional `meta-data`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubHeader {
    /// This payload's type declaration.
    pub type_info: TypeInfo,
    /// Optional free-form JSON metadata, validated per spec §4.3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<BTreeMap<String, MetaValue>>,
}

/// The fully-parsed `header.tar` contents (spec §3 "Header").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Header {
    /// Global metadata.
    pub header_info: HeaderInfo,
    /// State script file names found under `scripts/`, in archive order.
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Exactly one entry per payload index.
    pub sub_headers: Vec<SubHeader>,
}

impl Header {
    /// Cross-check invariants spanning `header_info` and `sub_headers`
    /// (spec §3 "Every `data/NNNN.tar`... has a matching sub-header index").
    pub fn validate(&self) -> Result<()> {
        self.header_info.validate()?;
        if self.sub_headers.len() != self.header_info.payloads.len() {
            return Err(anyhow!(
                "header: {} payload declarations but {} sub-headers",
                self.header_info.payloads.len(),
                self.sub_headers.len()
            ));
        }
        for (decl, sub) in self.header_info.payloads.iter().zip(self.sub_headers.iter()) {
            sub.type_info.validate()?;
            if !decl.payload_type.is_empty() && decl.payload_type != sub.type_info.payload_type {
                return Err(anyhow!(
                    "header: payload type mismatch, header-info says {} but type-info says {}",
                    decl.payload_type,
                    sub.type_info.payload_type
                ));
            }
        }
        Ok(())
    }
}
