//! Recursive discovery of packages and rules.
//!
//! Each package is evaluated by its own pool task. While registering rules, a
//! task parses their dependency references and schedules a new task for
//! every referenced package the factory has not seen yet. The caller blocks
//! on a pending-job counter until the fan-out converges.
//!
//! The first fatal error is kept and every task scheduled afterwards returns
//! immediately, so a broken tree stops loading quickly.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::{BuildError, Result};
use crate::frontend::ScriptFrontend;
use crate::id::{self, Position};
use crate::model::{BuildPackageFactory, RuleArena, factory};
use crate::pool::PoolHandle;
use crate::session::{ProjectLayout, Session};

/// Load every package reachable from `root_files` into `packages` and
/// `arena`.
///
/// Root files are BUILD files given relative to the project root (or
/// absolute inside it). Returns once every transitively referenced package
/// has been evaluated.
///
/// # Errors
///
/// Returns the first error raised by any loader task: unreadable or
/// malformed BUILD files, invalid rule declarations, malformed dependency
/// references, or builtin references with no builtin root configured.
pub fn load_build_files(
    session: &Session,
    packages: &Arc<BuildPackageFactory>,
    arena: &Arc<RuleArena>,
    root_files: &[Utf8PathBuf],
) -> Result<()> {
    let ctx = Arc::new(LoadContext {
        layout: session.layout().clone(),
        frontend: session.frontend(),
        packages: Arc::clone(packages),
        arena: Arc::clone(arena),
        pool: session.pool().handle(),
        pending: PendingJobs::default(),
        cancelled: AtomicBool::new(false),
        first_error: Mutex::new(None),
    });

    for file in root_files {
        let (package, path) = session.layout().package_for_file(file)?;
        LoadContext::schedule(&ctx, package, path, None);
    }
    ctx.pending.wait_for_zero();

    if let Some(err) = ctx.first_error.lock().take() {
        return Err(err);
    }
    info!(
        packages = packages.packages().len(),
        rules = arena.len(),
        "loaded build files"
    );
    Ok(())
}

/// Counts scheduled loader tasks that have not finished.
#[derive(Debug, Default)]
struct PendingJobs {
    count: Mutex<usize>,
    zero: Condvar,
}

impl PendingJobs {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    fn wait_for_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

/// State shared by every loader task of one run.
struct LoadContext {
    layout: ProjectLayout,
    frontend: Arc<dyn ScriptFrontend>,
    packages: Arc<BuildPackageFactory>,
    arena: Arc<RuleArena>,
    pool: PoolHandle,
    pending: PendingJobs,
    cancelled: AtomicBool,
    first_error: Mutex<Option<BuildError>>,
}

/// The rule and raw reference that caused a package to be scheduled.
struct Referrer {
    rule: String,
    target: String,
}

/// Decrements the pending counter however the task ends.
///
/// The guard is created before the task is queued and moved into it, so a
/// task the pool discards without running still releases its slot. A task
/// that did not reach the end records a failure.
struct PendingGuard {
    ctx: Arc<LoadContext>,
    package: String,
    completed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.ctx.fail(BuildError::Internal(format!(
                "loader task for package '{}' did not complete",
                self.package
            )));
        }
        self.ctx.pending.decrement();
    }
}

impl LoadContext {
    fn schedule(
        ctx: &Arc<Self>,
        package: String,
        build_file: Utf8PathBuf,
        referrer: Option<Referrer>,
    ) {
        ctx.pending.increment();
        let mut guard = PendingGuard {
            ctx: Arc::clone(ctx),
            package,
            completed: false,
        };
        let _detached = ctx.pool.push(move || {
            let ctx = Arc::clone(&guard.ctx);
            if !ctx.is_cancelled() {
                if let Err(err) = ctx.load_package(&guard.package, &build_file) {
                    ctx.fail(missing_package(err, referrer));
                }
            }
            guard.completed = true;
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fail(&self, err: BuildError) {
        self.cancelled.store(true, Ordering::Release);
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            debug!(error = %err, "loader failed; cancelling remaining tasks");
            *slot = Some(err);
        }
    }

    fn load_package(self: &Arc<Self>, name: &str, build_file: &Utf8Path) -> Result<()> {
        let (package, is_new) = self.packages.get_or_create(name);
        if !is_new || !package.begin(build_file.to_path_buf()) {
            return Ok(());
        }
        debug!(package = name, %build_file, "evaluating package");

        let calls = self.frontend.evaluate_file(build_file)?;
        let mut referenced = HashSet::new();
        for call in &calls {
            let decl = factory::construct(call, build_file)?;
            let raw_deps = decl.raw_deps.clone();
            let rule_id = package.add_rule(&self.arena, decl)?;
            for raw in &raw_deps {
                let dep = id::parse(raw)?;
                if dep.position == Position::This {
                    continue;
                }
                let target = dep.resolve_package(name);
                if target == name || !referenced.insert(target.clone()) {
                    continue;
                }
                if self.packages.contains(&target) {
                    continue;
                }
                let rule = self
                    .arena
                    .get(rule_id)
                    .map(|r| r.full_qualified_name().to_owned())
                    .unwrap_or_default();
                let Some(target_file) = self.layout.build_file_for(&target) else {
                    return Err(BuildError::DependencyNotFound {
                        rule,
                        target: format!("{raw} (no builtin root is configured)"),
                    });
                };
                let referrer = Referrer {
                    rule,
                    target: raw.clone(),
                };
                Self::schedule(self, target, target_file, Some(referrer));
            }
        }
        package.finish();
        Ok(())
    }
}

/// A referenced package whose BUILD file does not exist is a resolution
/// failure of the referring rule, not an I/O failure.
fn missing_package(err: BuildError, referrer: Option<Referrer>) -> BuildError {
    match (err, referrer) {
        (BuildError::Io { source, .. }, Some(Referrer { rule, target }))
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            BuildError::DependencyNotFound { rule, target }
        }
        (err, _) => err,
    }
}
