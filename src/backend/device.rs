// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! The device mapper (C10): assigns each worker a device id before any
//! worker starts, per spec.md 4.4 step 1.

use crate::common::{DeviceId, CPU_DEVICE};

/// How the caller wants devices assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceHint {
    /// Use whatever accelerators `DeviceProbe` reports, cycling if there
    /// are fewer of them than workers.
    Auto,
    /// Pin every worker to the CPU, regardless of what's probed.
    CpuOnly,
    /// Use exactly these device ids, cycling if there are fewer than
    /// workers.
    Explicit(Vec<DeviceId>),
}

/// Abstracts over accelerator discovery so device mapping is testable
/// without a real GPU present. Implementations return available device
/// ids sorted by free memory descending, matching `_get_device_map`'s use
/// of `GPUtil.getAvailable(order='memory')`.
pub trait DeviceProbe {
    fn available_devices(&self) -> Vec<DeviceId>;
}

/// A `DeviceProbe` that always reports no accelerators, for CPU-only
/// deployments and for most tests.
pub struct NoDevices;

impl DeviceProbe for NoDevices {
    fn available_devices(&self) -> Vec<DeviceId> { Vec::new() }
}

/// Assigns one device id per worker. Direct generalization of
/// `helper.py`'s `_get_device_map`: round-robins over the probed (or
/// explicit) device list, reusing ids cyclically when there are fewer
/// devices than workers, and falls back to CPU entirely when none are
/// available.
pub fn map_devices(num_workers: usize, hint: &DeviceHint, probe: &dyn DeviceProbe) -> Vec<DeviceId> {
    let candidates = match hint {
        DeviceHint::CpuOnly => Vec::new(),
        DeviceHint::Explicit(ids) => ids.clone(),
        DeviceHint::Auto => probe.available_devices(),
    };

    if candidates.is_empty() {
        return vec![CPU_DEVICE; num_workers];
    }

    (0..num_workers).map(|i| candidates[i % candidates.len()]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProbe(Vec<DeviceId>);

    impl DeviceProbe for FakeProbe {
        fn available_devices(&self) -> Vec<DeviceId> { self.0.clone() }
    }

    #[test]
    fn falls_back_to_cpu_when_no_devices() {
        let map = map_devices(4, &DeviceHint::Auto, &NoDevices);
        assert_eq!(map, vec![CPU_DEVICE; 4]);
    }

    #[test]
    fn cycles_devices_when_undersupplied() {
        let probe = FakeProbe(vec![0, 1]);
        let map = map_devices(5, &DeviceHint::Auto, &probe);
        assert_eq!(map, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn one_device_per_worker_when_evenly_supplied() {
        let probe = FakeProbe(vec![0, 1, 2]);
        let map = map_devices(3, &DeviceHint::Auto, &probe);
        assert_eq!(map, vec![0, 1, 2]);
    }

    #[test]
    fn cpu_only_hint_ignores_probe() {
        let probe = FakeProbe(vec![0, 1]);
        let map = map_devices(3, &DeviceHint::CpuOnly, &probe);
        assert_eq!(map, vec![CPU_DEVICE; 3]);
    }

    #[test]
    fn explicit_hint_overrides_probe() {
        let probe = FakeProbe(vec![9]);
        let map = map_devices(2, &DeviceHint::Explicit(vec![3, 4]), &probe);
        assert_eq!(map, vec![3, 4]);
    }
}
