//! The process-wide shim instance.
//!
//! Start-up builds a [`ShimContext`]: the rules, their regions and the router
//! on top of them. Installing it publishes it to the interception hooks,
//! which until then forward every call to the real primitives.
//!
//! The context is never torn down at exit. The kernel reclaims the regions
//! with the rest of the address space, and destructors running after `main`
//! can still allocate.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::{info, warn};

use crate::config::ConfigModel;
use crate::error::ShimError;
use crate::fallback::{FallbackAllocator, SystemFallback};
use crate::hugetlb::HugeTlb;
use crate::kernel::{Kernel, PlatformMemory};
use crate::parser;
use crate::reserve::reserve;
use crate::router::Router;
use crate::settings::ShimSettings;

static INSTALLED: AtomicPtr<ShimContext> = AtomicPtr::new(ptr::null_mut());

#[derive(Debug)]
pub struct ShimContext {
    settings: ShimSettings,
    model: ConfigModel,
    router: Router,
}

impl ShimContext {
    pub fn settings(&self) -> &ShimSettings {
        &self.settings
    }

    pub fn model(&self) -> &ConfigModel {
        &self.model
    }

    pub fn router(&self) -> &Router {
        &self.router
    }
}

/// Reads the rules named by `settings` and reserves their regions on the
/// real kernel.
pub fn bootstrap(settings: &ShimSettings) -> Result<ShimContext, ShimError> {
    let model = parser::parse_file(&settings.config_file)?;

    if !settings.dry_run {
        let pool = HugeTlb::system();
        for shortfall in pool.shortfalls(&model) {
            warn!(
                "{} pool has {} free pages, rules need {}",
                shortfall.page_size, shortfall.free, shortfall.needed
            );
        }
    }

    bootstrap_with(model, Arc::new(Kernel), Arc::new(SystemFallback), settings)
}

/// Builds a context from an already parsed model on arbitrary backends.
pub fn bootstrap_with(
    model: ConfigModel,
    platform: Arc<dyn PlatformMemory>,
    fallback: Arc<dyn FallbackAllocator>,
    settings: &ShimSettings,
) -> Result<ShimContext, ShimError> {
    let table = reserve(&model, platform, &settings.reserve_options())?;
    info!(
        "{} rules active, heap at {:#x}",
        model.rules().len(),
        table.heap().base()
    );

    let router = Router::new(Arc::new(table), fallback, settings.heap_spill);
    Ok(ShimContext {
        settings: settings.clone(),
        model,
        router,
    })
}

/// Publishes `context` to the hooks. Only one context can be installed.
pub fn install(context: ShimContext) -> Result<&'static ShimContext, ShimError> {
    let raw = Box::into_raw(Box::new(context));

    match INSTALLED.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(unsafe { &*raw }),
        Err(_) => {
            drop(unsafe { Box::from_raw(raw) });
            Err(ShimError::AlreadyInstalled)
        }
    }
}

/// The installed context, if start-up got that far.
#[inline]
pub fn current() -> Option<&'static ShimContext> {
    let raw = INSTALLED.load(Ordering::Acquire);
    unsafe { raw.as_ref() }
}

/// Takes the installed context back.
///
/// # Safety
///
/// No reference returned by [`current`] or [`install`] may be used afterwards,
/// which in practice means no hook may be running or run again.
pub unsafe fn uninstall() -> Option<ShimContext> {
    let raw = INSTALLED.swap(ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
        None
    } else {
        Some(*unsafe { Box::from_raw(raw) })
    }
}
