//! Partial loading of pretrained weights into a [`VarMap`].
//!
//! Backbone checkpoints usually carry more (classification heads) or fewer
//! (our decoder) tensors than the model being trained. Only the intersection
//! of names is copied; everything else is counted in a [`LoadReport`].
use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle::{Device, Result, Tensor};
use candle_nn::VarMap;

/// Key under which training scripts usually nest the state dict of a `.pth` file.
const PTH_STATE_KEY: &str = "model";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Variables overwritten from the checkpoint.
    pub loaded: Vec<String>,
    /// Checkpoint entries with no matching variable.
    pub skipped: Vec<String>,
    /// Variables under the prefix the checkpoint did not provide.
    pub missing: Vec<String>,
}

/// Reads every tensor of a `.safetensors` or pytorch checkpoint onto `device`.
pub fn read_tensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    match extension {
        "safetensors" => candle::safetensors::load(path, device),
        "pth" | "pt" | "bin" => {
            let keyed = candle::pickle::read_all_with_key(path, Some(PTH_STATE_KEY))?;
            let tensors = state_dict_or_top_level(keyed, || {
                tracing::debug!("no `{PTH_STATE_KEY}` entry in {path:?}, reading the top level");
                candle::pickle::read_all(path)
            })?;
            tensors
                .into_iter()
                .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
                .collect()
        }
        _ => candle::bail!("unsupported checkpoint format {path:?}"),
    }
}

/// Falls back to the top-level table only when the nested state dict came back empty.
fn state_dict_or_top_level<F>(
    keyed: Vec<(String, Tensor)>,
    top_level: F,
) -> Result<Vec<(String, Tensor)>>
where
    F: FnOnce() -> Result<Vec<(String, Tensor)>>,
{
    if keyed.is_empty() {
        top_level()
    } else {
        Ok(keyed)
    }
}

/// Copies every checkpoint tensor whose name matches a variable `prefix.name`
/// of `varmap`. An empty prefix matches names as they are.
///
/// Values are cast to the dtype and device of the variable they replace. A
/// matching name with a different shape is an error, in which case no
/// variable is modified.
pub fn load_matching(
    varmap: &VarMap,
    prefix: &str,
    tensors: HashMap<String, Tensor>,
) -> Result<LoadReport> {
    let full_name = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle::Error::Msg(format!("varmap lock poisoned: {e}")))?;

    let mut report = LoadReport::default();
    let mut matched = Vec::new();
    for (name, tensor) in tensors.into_iter() {
        let target = full_name(&name);
        let Some(var) = data.get(&target) else {
            tracing::debug!("skipping checkpoint entry {name}");
            report.skipped.push(name);
            continue;
        };
        if var.shape() != tensor.shape() {
            candle::bail!(
                "shape mismatch for {target}: model {:?}, checkpoint {:?}",
                var.shape(),
                tensor.shape()
            )
        }
        matched.push((target, var, tensor));
    }

    // Every value is cast before the first variable is set.
    let values = matched
        .into_iter()
        .map(|(target, var, tensor)| {
            let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
            Ok((target, var, value))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut seen = HashSet::new();
    for (target, var, value) in values.into_iter() {
        var.set(&value)?;
        seen.insert(target.clone());
        report.loaded.push(target);
    }

    let scope = full_name("");
    report.missing = data
        .keys()
        .filter(|name| prefix.is_empty() || name.starts_with(&scope))
        .filter(|name| !seen.contains(*name))
        .cloned()
        .collect();
    report.loaded.sort();
    report.skipped.sort();
    report.missing.sort();
    tracing::info!(
        "loaded {} tensors into `{prefix}`, skipped {}, {} left at their initial values",
        report.loaded.len(),
        report.skipped.len(),
        report.missing.len()
    );
    Ok(report)
}
