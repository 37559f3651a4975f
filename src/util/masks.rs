// SPDX-License-Identifier: MIT OR Apache-2.0

//! Additive attention masks.
//!
//! Masks hold `0.0` where a query may attend and `-inf` elsewhere, shaped
//! `[1, 1, seq, seq]` for broadcasting over batch and heads.  A mask entry
//! depends only on `i - j`, so one square mask per `(window, device, dtype)`
//! is kept at the largest length seen and narrowed for shorter requests.
//! The cache therefore holds at most one tensor per key however many
//! distinct lengths generation walks through.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use candle_core::{DType, Device, DeviceLocation, Tensor};

use crate::error::Result;

/// Cache key: optional window, device location, dtype.
type MaskKey = (Option<usize>, DeviceKey, DType);

/// Device kind plus ordinal, so two GPUs never share a tensor.
type DeviceKey = (u8, usize);

static MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_key(device: &Device) -> DeviceKey {
    match device.location() {
        DeviceLocation::Cpu => (0, 0),
        DeviceLocation::Cuda { gpu_id } => (1, gpu_id),
        DeviceLocation::Metal { gpu_id } => (2, gpu_id),
    }
}

/// Causal mask: query `i` sees keys `j <= i`.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, seq_len]`
///
/// # Errors
///
/// Returns [`InterpError::Model`](crate::InterpError::Model) on tensor failures.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    cached_mask(seq_len, None, device, dtype)
}

/// Sliding-window causal mask: query `i` sees keys `j` with
/// `j <= i` and `i - j < window`, i.e. the last `window` positions
/// including itself.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, seq_len]`
///
/// # Errors
///
/// Returns [`InterpError::Model`](crate::InterpError::Model) on tensor failures.
pub fn create_sliding_window_mask(
    seq_len: usize,
    window: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    cached_mask(seq_len, Some(window), device, dtype)
}

/// Drop every cached mask.
pub fn clear_mask_cache() {
    MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

fn build_mask(size: usize, window: Option<usize>, device: &Device, dtype: DType) -> Result<Tensor> {
    let data: Vec<f32> = (0..size)
        .flat_map(|i| {
            (0..size).map(move |j| {
                let outside_window = window.is_some_and(|w| i.saturating_sub(j) >= w);
                if j > i || outside_window {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(data, (1, 1, size, size), device)?.to_dtype(dtype)?)
}

fn cached_mask(
    seq_len: usize,
    window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let key = (window, device_key(device), dtype);
    let mut cache = MASK_CACHE.lock().unwrap_or_else(PoisonError::into_inner);

    let full = match cache.get(&key) {
        Some(mask) if mask.dim(2)? >= seq_len => mask.clone(),
        _ => {
            let mask = build_mask(seq_len, window, device, dtype)?;
            cache.insert(key, mask.clone());
            mask
        }
    };
    drop(cache);

    if full.dim(2)? == seq_len {
        return Ok(full);
    }
    Ok(full.narrow(2, 0, seq_len)?.narrow(3, 0, seq_len)?)
}

/// Side length of the cached mask for a key, if any.
#[cfg(test)]
fn cached_size(window: Option<usize>, device: &Device, dtype: DType) -> Option<usize> {
    MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&(window, device_key(device), dtype))
        .and_then(|m| m.dim(2).ok())
}
