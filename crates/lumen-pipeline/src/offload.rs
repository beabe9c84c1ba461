//! Running one stage on the host or the accelerator.
//!
//! Buffers move between host cache lines and device memory. A
//! [`Placement`] records where the valid copy of a stage's output
//! lives. Device failures before the stage has produced anything fall
//! back to the host; a failure to copy a device-only input back to the
//! host is unrecoverable for this run and reported as
//! [`OffloadError::DeviceFault`].

use std::convert::Infallible;

use tracing::warn;

use crate::accelerator::{Accelerator, DeviceBuffer};
use crate::blend::{self, BlendParams};
use crate::cache::{CacheStore, LineId};
use crate::diagnostics::StageOutcome;
use crate::roi::{CHANNELS, Roi};
use crate::stage::{Stage, StageCapabilities};
use crate::tiling::{max_tile_pixels, plan_tiles, run_tiled};
use crate::types::{AcceleratorError, BaseImage};

/// A host buffer: the base image or a cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferRef {
    Base,
    Line(LineId),
}

/// Where the valid copy of a buffer lives.
#[derive(Debug)]
pub(crate) enum Placement {
    /// Valid on the host only.
    Host(BufferRef),
    /// Valid on the device only; the line is reserved for copying back.
    Device { line: LineId, buffer: DeviceBuffer },
    /// Valid on both.
    Both { slot: BufferRef, buffer: DeviceBuffer },
}

impl Placement {
    /// The cache line backing this placement, if any.
    pub(crate) const fn line(&self) -> Option<LineId> {
        match self {
            Self::Host(BufferRef::Line(id))
            | Self::Device { line: id, .. }
            | Self::Both {
                slot: BufferRef::Line(id),
                ..
            } => Some(*id),
            Self::Host(BufferRef::Base) | Self::Both { slot: BufferRef::Base, .. } => None,
        }
    }

    /// The host buffer, if its content is valid.
    pub(crate) const fn host(&self) -> Option<BufferRef> {
        match self {
            Self::Host(slot) | Self::Both { slot, .. } => Some(*slot),
            Self::Device { .. } => None,
        }
    }

    /// Drop device memory, invalidating lines whose only valid copy was
    /// on the device.
    pub(crate) fn discard(self, cache: &mut CacheStore, accel: Option<&dyn Accelerator>) {
        match self {
            Self::Host(_) => {}
            Self::Device { line, buffer } => {
                cache.invalidate(line);
                if let Some(accel) = accel {
                    accel.release(buffer);
                }
            }
            Self::Both { buffer, .. } => {
                if let Some(accel) = accel {
                    accel.release(buffer);
                }
            }
        }
    }
}

/// Why a stage could not be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OffloadError {
    /// A device-only buffer could not be brought back to the host.
    DeviceFault,
    /// The input buffer is gone.
    MissingBuffer,
}

/// What a stage needs besides buffers.
pub(crate) struct StageJob<'a> {
    pub stage: &'a dyn Stage,
    pub capabilities: StageCapabilities,
    pub blend: &'a BlendParams,
    pub roi_in: &'a Roi,
    pub roi_out: &'a Roi,
}

/// The result of running a stage.
#[derive(Debug)]
pub(crate) struct StageRun {
    pub output: Placement,
    pub outcome: StageOutcome,
}

pub(crate) fn host_slice<'a>(
    cache: &'a CacheStore,
    base: Option<&'a BaseImage>,
    slot: BufferRef,
    len: usize,
) -> Option<&'a [f32]> {
    match slot {
        BufferRef::Base => base?.as_slice().get(..len),
        BufferRef::Line(id) => cache.line(id).get(..len),
    }
}

fn host_io<'a>(
    cache: &'a mut CacheStore,
    base: Option<&'a BaseImage>,
    input: BufferRef,
    output: LineId,
    in_len: usize,
    out_len: usize,
) -> Option<(&'a [f32], &'a mut [f32])> {
    match input {
        BufferRef::Base => {
            let i = base?.as_slice().get(..in_len)?;
            let o = cache.line_mut(output).get_mut(..out_len)?;
            Some((i, o))
        }
        BufferRef::Line(id) => {
            let (i, o) = cache.pair_mut(id, output)?;
            Some((i.get(..in_len)?, o.get_mut(..out_len)?))
        }
    }
}

/// Compute `output` from `input` with the stage in `job`.
///
/// Consumes the input placement: any device copy of it is released
/// here, and a line whose only valid copy was on the device is
/// invalidated once the stage has consumed it.
pub(crate) fn run_stage(
    job: &StageJob<'_>,
    cache: &mut CacheStore,
    base: Option<&BaseImage>,
    accel: Option<&dyn Accelerator>,
    host_limit: usize,
    input: Placement,
    output: LineId,
) -> Result<StageRun, OffloadError> {
    let in_len = job.roi_in.buffer_len();
    let (slot, mut in_dev, mut host_valid) = split(input);

    let device = accel.filter(|_| job.capabilities.accelerator && job.stage.accelerator_ready());
    let mut fell_back = false;
    if let Some(dev) = device {
        let req = job.stage.tiling(job.roi_in, job.roi_out);
        let pixels = job.roi_in.pixel_count().max(job.roi_out.pixel_count());
        if req.bytes_for(pixels) <= dev.memory_budget() {
            match run_device(job, cache, base, dev, slot, &mut in_dev) {
                Ok(buffer) => {
                    if let Some(b) = in_dev.take() {
                        dev.release(b);
                    }
                    if !host_valid && let BufferRef::Line(id) = slot {
                        cache.invalidate(id);
                    }
                    return Ok(StageRun {
                        output: Placement::Device {
                            line: output,
                            buffer,
                        },
                        outcome: StageOutcome::Device,
                    });
                }
                Err(e) => {
                    warn!(op = job.stage.op(), error = %e, "device run failed, using host");
                    fell_back = true;
                }
            }
        } else if job.capabilities.tiling {
            bring_home(accel, cache, slot, &mut in_dev, &mut host_valid, in_len)?;
            let out_len = job.roi_out.buffer_len();
            let (i, o) = host_io(cache, base, slot, output, in_len, out_len)
                .ok_or(OffloadError::MissingBuffer)?;
            match run_device_tiled(job, dev, i, o) {
                Ok(()) => {
                    blend_host(job, i, o);
                    return Ok(StageRun {
                        output: Placement::Host(BufferRef::Line(output)),
                        outcome: StageOutcome::DeviceTiled,
                    });
                }
                Err(e) => {
                    warn!(op = job.stage.op(), error = %e, "tiled device run failed, using host");
                    fell_back = true;
                }
            }
        }
    }

    bring_home(accel, cache, slot, &mut in_dev, &mut host_valid, in_len)?;
    let out_len = job.roi_out.buffer_len();
    let (i, o) =
        host_io(cache, base, slot, output, in_len, out_len).ok_or(OffloadError::MissingBuffer)?;
    let tiled = run_host(job, i, o, host_limit);
    blend_host(job, i, o);
    let outcome = match (fell_back, tiled) {
        (true, _) => StageOutcome::DeviceFallback,
        (false, true) => StageOutcome::HostTiled,
        (false, false) => StageOutcome::Host,
    };
    Ok(StageRun {
        output: Placement::Host(BufferRef::Line(output)),
        outcome,
    })
}

/// Host slot, device copy, and whether the host copy is valid.
fn split(input: Placement) -> (BufferRef, Option<DeviceBuffer>, bool) {
    match input {
        Placement::Host(slot) => (slot, None, true),
        Placement::Both { slot, buffer } => (slot, Some(buffer), true),
        Placement::Device { line, buffer } => (BufferRef::Line(line), Some(buffer), false),
    }
}

/// Lay out `input`, which covers `covered`, inside `output` as the
/// larger region `padded`. Pixels outside `covered` are black. `None`
/// means nothing of `padded` is covered.
///
/// Consumes the input placement the same way [`run_stage`] does.
pub(crate) fn pad_into(
    cache: &mut CacheStore,
    base: Option<&BaseImage>,
    accel: Option<&dyn Accelerator>,
    input: Option<Placement>,
    covered: &Roi,
    padded: &Roi,
    output: LineId,
) -> Result<Placement, OffloadError> {
    let out_len = padded.buffer_len();
    let Some(input) = input else {
        cache
            .line_mut(output)
            .get_mut(..out_len)
            .ok_or(OffloadError::MissingBuffer)?
            .fill(0.0);
        return Ok(Placement::Host(BufferRef::Line(output)));
    };

    let in_len = covered.buffer_len();
    let (slot, mut in_dev, mut host_valid) = split(input);
    bring_home(accel, cache, slot, &mut in_dev, &mut host_valid, in_len)?;
    let (i, o) =
        host_io(cache, base, slot, output, in_len, out_len).ok_or(OffloadError::MissingBuffer)?;
    o.fill(0.0);

    let dx = usize::try_from(covered.x - padded.x).unwrap_or(0);
    let dy = usize::try_from(covered.y - padded.y).unwrap_or(0);
    let row = covered.width as usize * CHANNELS;
    if row == 0 {
        return Ok(Placement::Host(BufferRef::Line(output)));
    }
    for (r, src) in i.chunks_exact(row).enumerate() {
        let d = ((dy + r) * padded.width as usize + dx) * CHANNELS;
        if let Some(dst) = o.get_mut(d..d + row) {
            dst.copy_from_slice(src);
        }
    }
    Ok(Placement::Host(BufferRef::Line(output)))
}

/// Make the host copy of the input valid and release its device copy.
fn bring_home(
    accel: Option<&dyn Accelerator>,
    cache: &mut CacheStore,
    slot: BufferRef,
    in_dev: &mut Option<DeviceBuffer>,
    host_valid: &mut bool,
    len: usize,
) -> Result<(), OffloadError> {
    let Some(buffer) = in_dev.take() else {
        return Ok(());
    };
    let Some(accel) = accel else {
        return Err(OffloadError::DeviceFault);
    };
    if *host_valid {
        accel.release(buffer);
        return Ok(());
    }
    let BufferRef::Line(id) = slot else {
        accel.release(buffer);
        return Err(OffloadError::MissingBuffer);
    };
    let result = match cache.line_mut(id).get_mut(..len) {
        Some(host) => accel.download(&buffer, host),
        None => Err(AcceleratorError::Transfer("host line too small".to_owned())),
    };
    accel.release(buffer);
    match result {
        Ok(()) => {
            *host_valid = true;
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "copying device input back to host failed");
            cache.invalidate(id);
            Err(OffloadError::DeviceFault)
        }
    }
}

fn run_device(
    job: &StageJob<'_>,
    cache: &CacheStore,
    base: Option<&BaseImage>,
    accel: &dyn Accelerator,
    slot: BufferRef,
    in_dev: &mut Option<DeviceBuffer>,
) -> Result<DeviceBuffer, AcceleratorError> {
    let input = match in_dev.take() {
        Some(buffer) => buffer,
        None => {
            let host = host_slice(cache, base, slot, job.roi_in.buffer_len())
                .ok_or_else(|| AcceleratorError::Transfer("missing host input".to_owned()))?;
            accel.upload(host)?
        }
    };
    let input = in_dev.insert(input);
    let output = accel.alloc(job.roi_out.buffer_len())?;
    let (roi_in, roi_out) = (job.roi_in, job.roi_out);
    let result = accel
        .dispatch(input, &output, &mut |i, o| job.stage.process_device(i, o, roi_in, roi_out))
        .and_then(|()| {
            if job.capabilities.blending && job.blend.is_active() {
                accel.dispatch(input, &output, &mut |i, o| {
                    blend::blend(job.blend, i, o, roi_in, roi_out);
                    Ok(())
                })
            } else {
                Ok(())
            }
        });
    match result {
        Ok(()) => Ok(output),
        Err(e) => {
            accel.release(output);
            Err(e)
        }
    }
}

fn run_device_tiled(
    job: &StageJob<'_>,
    accel: &dyn Accelerator,
    input: &[f32],
    output: &mut [f32],
) -> Result<(), AcceleratorError> {
    if !job.roi_in.same_area(job.roi_out) {
        return Err(AcceleratorError::Unsupported);
    }
    let req = job.stage.tiling(job.roi_in, job.roi_out);
    let budget = accel.memory_budget();
    let tiles = plan_tiles(
        job.roi_out.width,
        job.roi_out.height,
        req.overlap,
        max_tile_pixels(&req, budget),
    )
    .ok_or(AcceleratorError::OutOfMemory {
        requested: req.bytes_for(1),
        available: budget,
    })?;
    run_tiled(input, output, job.roi_out, &tiles, |tile_in, tile_out, roi| {
        let i = accel.upload(tile_in)?;
        let o = match accel.alloc(tile_out.len()) {
            Ok(o) => o,
            Err(e) => {
                accel.release(i);
                return Err(e);
            }
        };
        let result = accel
            .dispatch(&i, &o, &mut |a, b| job.stage.process_device(a, b, roi, roi))
            .and_then(|()| accel.download(&o, tile_out));
        accel.release(i);
        accel.release(o);
        result
    })
}

/// Run on the host, tiling when the stage allows it and the full
/// region would exceed `limit` bytes. Returns whether it tiled.
fn run_host(job: &StageJob<'_>, input: &[f32], output: &mut [f32], limit: usize) -> bool {
    let req = job.stage.tiling(job.roi_in, job.roi_out);
    let pixels = job.roi_in.pixel_count().max(job.roi_out.pixel_count());
    if job.capabilities.tiling
        && req.bytes_for(pixels) > limit
        && job.roi_in.same_area(job.roi_out)
        && let Some(tiles) = plan_tiles(
            job.roi_out.width,
            job.roi_out.height,
            req.overlap,
            max_tile_pixels(&req, limit),
        )
    {
        let Ok(()) = run_tiled::<Infallible>(input, output, job.roi_out, &tiles, |i, o, roi| {
            job.stage.process(i, o, roi, roi);
            Ok(())
        });
        return true;
    }
    job.stage.process(input, output, job.roi_in, job.roi_out);
    false
}

fn blend_host(job: &StageJob<'_>, input: &[f32], output: &mut [f32]) {
    if job.capabilities.blending {
        blend::blend(job.blend, input, output, job.roi_in, job.roi_out);
    }
}
