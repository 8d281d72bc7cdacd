//! Content-keyed cache of compiled IR.

use std::collections::HashMap;
use std::sync::Arc;

use converge_foundation::ModuleId;
use tracing::{debug, info};

use crate::declaration::ModuleDeclaration;
use crate::error::Result;

use super::builder::compile;
use super::exec::ExecIr;
use super::types::StaticIr;

/// A compiled module: static IR and its execution projection.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub ir: Arc<StaticIr>,
    pub exec: Arc<ExecIr>,
}

#[derive(Debug)]
struct CacheEntry {
    compiled: CompiledModule,
    /// Content digest of the declaration that produced `compiled`.
    digest: u64,
}

/// Compiled IR per module, reused while the declaration digest is unchanged.
///
/// Owned by a runtime rather than living in global state; [`IrCache::reset`]
/// clears it between tests.
#[derive(Debug, Default)]
pub struct IrCache {
    entries: HashMap<ModuleId, CacheEntry>,
    generations: HashMap<ModuleId, u64>,
    hits: u64,
    misses: u64,
}

impl IrCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiled IR for `declaration`, compiling on first use or when the
    /// compiled digest changed.
    ///
    /// On a digest match the cached [`ExecIr`] and generation are reused, but
    /// the returned [`StaticIr`] carries the derive and equality functions of
    /// `declaration`.
    ///
    /// A changed digest bumps the module's generation, which invalidates
    /// scratch buffers and plan caches built for older generations.
    pub fn get_or_compile(&mut self, declaration: &ModuleDeclaration) -> Result<CompiledModule> {
        let module = declaration.module_id();
        let generation = self.generations.get(module).copied().unwrap_or(0);
        let candidate = compile(declaration, generation.max(1))?;

        if let Some(entry) = self.entries.get_mut(module)
            && entry.digest == candidate.digest()
        {
            // Same graph, so the projection and cached plans still hold. The
            // step bodies always come from the declaration just compiled.
            let mut ir = candidate;
            ir.generation = generation;
            entry.compiled.ir = Arc::new(ir);
            self.hits += 1;
            debug!(module = %module, generation, "IR cache hit");
            return Ok(entry.compiled.clone());
        }

        let generation = generation + 1;
        let mut ir = candidate;
        ir.generation = generation;
        let digest = ir.digest();
        let exec = ExecIr::new(&ir);
        let compiled = CompiledModule {
            ir: Arc::new(ir),
            exec: Arc::new(exec),
        };

        self.misses += 1;
        self.generations.insert(module.clone(), generation);
        self.entries.insert(
            module.clone(),
            CacheEntry {
                compiled: compiled.clone(),
                digest,
            },
        );
        info!(module = %module, generation, digest = format_args!("{digest:016x}"), "IR compiled");
        Ok(compiled)
    }

    /// Current generation of a module, zero if never compiled.
    pub fn generation(&self, module: &ModuleId) -> u64 {
        self.generations.get(module).copied().unwrap_or(0)
    }

    /// (hits, misses).
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Drop every entry and generation counter.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.generations.clear();
        self.hits = 0;
        self.misses = 0;
    }
}
