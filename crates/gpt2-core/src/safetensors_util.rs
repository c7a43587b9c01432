use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use anyhow::Result;
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tch::{nn, Kind, Tensor};

/// Prefix used by Hugging Face GPT-2 checkpoints that also hold the LM head.
const HF_PREFIX: &str = "transformer.";

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// Tensors in the file with no matching variable.
    pub unexpected: Vec<String>,
    /// Variables the file did not provide.
    pub missing: Vec<String>,
}

/// Copies every tensor of a safetensors file into the var store variable of
/// the same name, converting dtype and device as needed.
pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut report = LoadReport::default();
    let mut seen = HashSet::new();

    for (name, view) in tensors.tensors() {
        let key = name.strip_prefix(HF_PREFIX).unwrap_or(name.as_str()).to_string();
        let Some(var) = variables.get_mut(&key) else {
            log::debug!("Tensor {} found in safetensors but not in model", name);
            report.unexpected.push(name);
            continue;
        };

        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        anyhow::ensure!(
            shape == var.size(),
            "shape mismatch for {}: file has {:?}, model expects {:?}",
            key,
            shape,
            var.size()
        );
        let kind = match view.dtype() {
            safetensors::Dtype::F32 => Kind::Float,
            safetensors::Dtype::F16 => Kind::Half,
            safetensors::Dtype::BF16 => Kind::BFloat16,
            _ => return Err(anyhow::anyhow!("Unsupported dtype: {:?}", view.dtype())),
        };

        let tch_tensor = Tensor::from_data_size(view.data(), &shape, kind).to_device(device);
        tch::no_grad(|| {
            var.copy_(&tch_tensor);
        });
        seen.insert(key);
        report.loaded += 1;
    }

    report.missing = variables
        .keys()
        .filter(|name| !seen.contains(*name))
        .cloned()
        .collect();
    report.missing.sort();

    if !report.unexpected.is_empty() {
        log::warn!("Ignored {} tensors not used by the model", report.unexpected.len());
    }

    Ok(report)
}
