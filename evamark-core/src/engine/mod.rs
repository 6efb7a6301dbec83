//! engine — binding to the native `eva` inference library
//!
//! The engine is reached through a fixed C ABI (no negotiation protocol):
//!
//! ```c
//! EvaContext *eva_init();
//! int  eva_infer(EvaContext *, int width, int height,
//!                const char *format, int pixel_stride, const void *image);
//! void eva_get_results(EvaContext *, EvaInferResult const **, int *count);
//! void eva_free(EvaContext *);
//! ```
//!
//! The binding owns the context handle for its whole lifetime: created once
//! in [`NativeEngine::load`], freed exactly once in `Drop`, never exposed to
//! callers. `eva_infer` and `eva_get_results` are not reentrant for one
//! handle — one submit/fetch cycle at a time, enforced here through
//! `&mut self` and a pending-count guard.
//!
//! Result records live in engine-owned memory that may be reused by the next
//! inference call, so [`NativeEngine::fetch_results`] copies every entry out
//! before returning.

use std::ffi::{c_char, c_int, c_void};
use std::path::Path;

use anyhow::{bail, Context, Result};
use libloading::Library;

use crate::video::BgrFrame;

/// Pixel format tag passed to `eva_infer` (null-terminated for the C side).
const FORMAT_TAG: &[u8] = b"bgr\0";
/// Interleaved BGR: three bytes per pixel.
pub const CHANNELS: u32 = 3;

// ── Wire-format records ──────────────────────────────────────────────────────
// Field order and widths are part of the engine ABI; do not reorder.

/// Detection box: top-left corner plus size, pixel units, may be fractional
/// and may extend outside the frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One engine result: a box plus a confidence score. Matches the engine's
/// `EvaInferResult` record byte for byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f32,
}

/// Opaque native engine context. Only ever handled behind a raw pointer.
#[repr(C)]
pub struct EvaContext {
    _private: [u8; 0],
}

type EvaInitFn = unsafe extern "C" fn() -> *mut EvaContext;
type EvaInferFn =
    unsafe extern "C" fn(*mut EvaContext, c_int, c_int, *const c_char, c_int, *const c_void) -> c_int;
type EvaGetResultsFn = unsafe extern "C" fn(*mut EvaContext, *mut *const Detection, *mut c_int);
type EvaFreeFn = unsafe extern "C" fn(*mut EvaContext);

// ── Engine seam ──────────────────────────────────────────────────────────────

/// The submit/fetch contract the pipeline driver runs against. Implemented
/// by [`NativeEngine`] for the real library and by scripted stubs in tests.
pub trait InferenceEngine {
    /// Submit one frame for inference and return the detection count.
    /// Zero means "no detections" and is a normal event; implementations
    /// must surface an engine error sentinel as `Err`, never as a count.
    fn submit(&mut self, frame: &BgrFrame) -> Result<u32>;

    /// Fetch the results of the last `submit` that returned a positive
    /// count. Valid only immediately after such a submit; the returned
    /// vector is caller-owned.
    fn fetch_results(&mut self) -> Result<Vec<Detection>>;
}

// ── Native implementation ────────────────────────────────────────────────────

/// Owns one live engine instance loaded from a shared library.
pub struct NativeEngine {
    infer: EvaInferFn,
    get_results: EvaGetResultsFn,
    free: EvaFreeFn,
    ctx: *mut EvaContext,
    /// Detection count of the last submit; `None` until the first submit
    /// and after each fetch. Guards the submit-then-fetch ordering.
    pending: Option<c_int>,
    // Dropped last: the function pointers above point into this mapping.
    _lib: Library,
}

impl NativeEngine {
    /// Load the shared library at `lib_path`, resolve the `eva_*` symbols
    /// and create the engine context. A null handle from `eva_init` is a
    /// fatal initialization failure — there is nothing to tear down.
    pub fn load<P: AsRef<Path>>(lib_path: P) -> Result<Self> {
        let lib_path = lib_path.as_ref();
        let lib = unsafe { Library::new(lib_path) }
            .with_context(|| format!("failed to load engine library: {}", lib_path.display()))?;

        let (init, infer, get_results, free) = unsafe {
            let init = *lib
                .get::<EvaInitFn>(b"eva_init\0")
                .context("engine library does not export eva_init")?;
            let infer = *lib
                .get::<EvaInferFn>(b"eva_infer\0")
                .context("engine library does not export eva_infer")?;
            let get_results = *lib
                .get::<EvaGetResultsFn>(b"eva_get_results\0")
                .context("engine library does not export eva_get_results")?;
            let free = *lib
                .get::<EvaFreeFn>(b"eva_free\0")
                .context("engine library does not export eva_free")?;
            (init, infer, get_results, free)
        };

        let ctx = unsafe { init() };
        if ctx.is_null() {
            bail!("eva_init returned a null context");
        }

        tracing::info!(path = %lib_path.display(), "native inference engine initialised");
        Ok(Self {
            infer,
            get_results,
            free,
            ctx,
            pending: None,
            _lib: lib,
        })
    }
}

impl InferenceEngine for NativeEngine {
    fn submit(&mut self, frame: &BgrFrame) -> Result<u32> {
        // The layout check repeats the driver's: a wrong buffer shape here
        // corrupts memory on the C side instead of raising an error.
        let expected = frame.width as usize * frame.height as usize * CHANNELS as usize;
        if frame.data.len() != expected {
            bail!(
                "refusing to submit misshapen frame: {} bytes for {}x{} BGR (expected {})",
                frame.data.len(),
                frame.width,
                frame.height,
                expected
            );
        }

        let count = unsafe {
            (self.infer)(
                self.ctx,
                frame.width as c_int,
                frame.height as c_int,
                FORMAT_TAG.as_ptr() as *const c_char,
                CHANNELS as c_int,
                frame.data.as_ptr() as *const c_void,
            )
        };

        if count < 0 {
            self.pending = None;
            bail!("eva_infer returned error sentinel {count}");
        }
        self.pending = Some(count);
        Ok(count as u32)
    }

    fn fetch_results(&mut self) -> Result<Vec<Detection>> {
        let submitted = match self.pending.take() {
            Some(n) if n > 0 => n,
            Some(_) => bail!("fetch_results called after a submit with no detections"),
            None => bail!("fetch_results called without a preceding submit"),
        };

        let mut results: *const Detection = std::ptr::null();
        let mut count: c_int = 0;
        unsafe { (self.get_results)(self.ctx, &mut results, &mut count) };

        if results.is_null() || count <= 0 {
            bail!("eva_get_results returned no result array for {submitted} detections");
        }

        // The array belongs to the engine and may be reused by the next
        // eva_infer call — copy everything out now.
        let copied = unsafe { std::slice::from_raw_parts(results, count as usize) }.to_vec();
        Ok(copied)
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        // `load` never constructs Self with a null ctx.
        unsafe { (self.free)(self.ctx) };
        tracing::debug!("native inference engine released");
    }
}

// `NativeEngine` owns its context exclusively; the raw pointer is never
// shared, so moving the whole engine across threads is sound.
unsafe impl Send for NativeEngine {}
