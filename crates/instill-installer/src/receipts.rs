use anyhow::{anyhow, Context, Result};
use instill_core::ResolvedScope;
use std::fs;
use std::path::PathBuf;

use crate::{ComponentRecord, ProductReceipt, ResourceKind, ResourceRecord, SystemLayout};

pub fn serialize_receipt(receipt: &ProductReceipt) -> String {
    let mut payload = String::new();
    payload.push_str(&format!("name={}\n", receipt.name));
    payload.push_str(&format!("manufacturer={}\n", receipt.manufacturer));
    payload.push_str(&format!("upgrade_code={}\n", receipt.upgrade_code));
    payload.push_str(&format!("version={}\n", receipt.version));
    payload.push_str(&format!("scope={}\n", receipt.scope.as_str()));
    for feature in &receipt.features {
        payload.push_str(&format!("feature={feature}\n"));
    }
    for component in &receipt.components {
        payload.push_str(&format!(
            "component={}|{}|{}\n",
            component.id, component.guid, component.key_path
        ));
    }
    for resource in &receipt.resources {
        payload.push_str(&format!(
            "resource={}|{}|{}\n",
            resource.kind.as_str(),
            resource.component,
            resource.path
        ));
    }
    for directory in &receipt.directories {
        payload.push_str(&format!("directory={directory}\n"));
    }
    for skipped in &receipt.skipped_components {
        payload.push_str(&format!("skipped_component={skipped}\n"));
    }
    if let Some(txid) = &receipt.txid {
        payload.push_str(&format!("txid={txid}\n"));
    }
    payload.push_str(&format!(
        "installed_at_unix={}\n",
        receipt.installed_at_unix
    ));
    payload
}

pub fn write_product_receipt(layout: &SystemLayout, receipt: &ProductReceipt) -> Result<PathBuf> {
    let path = layout.receipt_path(receipt.scope, &receipt.upgrade_code);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, serialize_receipt(receipt).as_bytes())
        .with_context(|| format!("failed to write product receipt: {}", path.display()))?;
    Ok(path)
}

/// Every product receipt on the system, sorted by upgrade code then scope.
pub fn read_product_receipts(layout: &SystemLayout) -> Result<Vec<ProductReceipt>> {
    let mut receipts = Vec::new();
    for scope in ResolvedScope::ALL {
        let dir = layout.products_scope_dir(scope);
        if !dir.exists() {
            continue;
        }

        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read products directory: {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some("receipt") {
                continue;
            }

            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read product receipt: {}", path.display()))?;
            let receipt = parse_receipt(&raw)
                .with_context(|| format!("failed to parse product receipt: {}", path.display()))?;
            receipts.push(receipt);
        }
    }

    receipts.sort_by(|a, b| {
        a.upgrade_code
            .cmp(&b.upgrade_code)
            .then_with(|| a.scope.cmp(&b.scope))
    });
    Ok(receipts)
}

pub(crate) fn parse_receipt(raw: &str) -> Result<ProductReceipt> {
    let mut name = None;
    let mut manufacturer = None;
    let mut upgrade_code = None;
    let mut version = None;
    let mut scope = None;
    let mut features = Vec::new();
    let mut components = Vec::new();
    let mut resources = Vec::new();
    let mut directories = Vec::new();
    let mut skipped_components = Vec::new();
    let mut txid = None;
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "name" => name = Some(v.to_string()),
            "manufacturer" => manufacturer = Some(v.to_string()),
            "upgrade_code" => upgrade_code = Some(v.to_string()),
            "version" => version = Some(v.to_string()),
            "scope" => {
                scope = Some(
                    ResolvedScope::parse(v).ok_or_else(|| anyhow!("invalid scope: {v}"))?,
                )
            }
            "feature" => features.push(v.to_string()),
            "component" => {
                let mut parts = v.splitn(3, '|');
                let (Some(id), Some(guid), Some(key_path)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(anyhow!("invalid component record: {v}"));
                };
                components.push(ComponentRecord {
                    id: id.to_string(),
                    guid: guid.to_string(),
                    key_path: key_path.to_string(),
                });
            }
            "resource" => {
                let mut parts = v.splitn(3, '|');
                let (Some(kind), Some(component), Some(path)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(anyhow!("invalid resource record: {v}"));
                };
                resources.push(ResourceRecord {
                    kind: ResourceKind::parse(kind)?,
                    component: component.to_string(),
                    path: path.to_string(),
                });
            }
            "directory" => directories.push(v.to_string()),
            "skipped_component" => skipped_components.push(v.to_string()),
            "txid" => txid = Some(v.to_string()),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(ProductReceipt {
        name: name.context("missing name")?,
        manufacturer: manufacturer.unwrap_or_default(),
        upgrade_code: upgrade_code.context("missing upgrade_code")?,
        version: version.context("missing version")?,
        scope: scope.context("missing scope")?,
        features,
        components,
        resources,
        directories,
        skipped_components,
        txid,
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}
