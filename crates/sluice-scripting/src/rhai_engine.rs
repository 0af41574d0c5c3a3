//! Rhai script engine implementation

use crate::api::{self, ScriptChain, ScriptRequest, ScriptResponse, Signal};
use crate::config::EngineSettings;
use crate::context::InterceptionContext;
use crate::engine::{CacheStats, EngineFactory, ScriptEngine, ScriptLanguage};
use crate::error::{Result, ScriptError};
use parking_lot::RwLock;
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::{Dynamic, Engine, EvalAltResult, OptimizationLevel, Position, Scope, AST};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Rhai script engine with AST caching
///
/// Modules are `<name>.rhai` files looked up in the module roots in order.
/// The entry module is compiled when the engine is built, so a broken
/// deployment fails construction instead of the first request.
#[derive(Debug)]
pub struct RhaiEngine {
    /// Rhai engine instance
    engine: Engine,
    /// Ordered module search roots
    roots: Vec<PathBuf>,
    /// Compiled AST cache (module name -> AST)
    ast_cache: RwLock<HashMap<String, Arc<AST>>>,
    /// Cache statistics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    verbose: bool,
}

impl RhaiEngine {
    /// Build an engine and compile its entry module
    pub fn new(settings: &EngineSettings) -> Result<Self> {
        let mut engine = Engine::new();

        // Configure engine for safety and performance
        engine.set_max_expr_depths(64, 32);
        engine.set_max_operations(settings.max_operations);
        engine.set_max_string_size(16 * 1024 * 1024);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);
        engine.set_strict_variables(settings.strict_variables);
        engine.set_optimization_level(optimization_level(settings.optimization_level));

        let mut resolver = ModuleResolversCollection::new();
        for root in &settings.module_roots {
            resolver.push(FileModuleResolver::new_with_path_and_extension(root, "rhai"));
        }
        engine.set_module_resolver(resolver);

        let debug_mode = settings.debug;
        engine.on_print(move |text| {
            if debug_mode {
                info!(script_print = text);
            } else {
                debug!(script_print = text);
            }
        });
        engine.on_debug(|text, source, pos| {
            debug!(script_debug = text, source = source.unwrap_or(""), line = pos.line());
        });

        api::register(&mut engine);

        let this = Self {
            engine,
            roots: settings.module_roots.clone(),
            ast_cache: RwLock::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            verbose: settings.verbose,
        };

        let ast = this.get_ast(&settings.module)?;
        if entry_arity(&ast, &settings.function).is_none() {
            return Err(ScriptError::FunctionNotFound {
                module: settings.module.clone(),
                function: settings.function.clone(),
            });
        }

        debug!(
            home = %settings.home.display(),
            module = %settings.module,
            function = %settings.function,
            strict = settings.strict_variables,
            "Rhai engine ready"
        );
        Ok(this)
    }

    fn module_file(&self, module: &str) -> Result<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(format!("{}.{}", module, ScriptLanguage::Rhai.extension())))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ScriptError::ModuleNotFound {
                module: module.to_string(),
                searched: self.roots.clone(),
            })
    }

    /// Get or compile AST
    fn get_ast(&self, module: &str) -> Result<Arc<AST>> {
        if let Some(ast) = self.ast_cache.read().get(module) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(module, "AST cache hit");
            return Ok(Arc::clone(ast));
        }

        // Cache miss - compile
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let path = self.module_file(module)?;
        trace!(module, path = %path.display(), "AST cache miss, compiling");

        let ast = self
            .engine
            .compile_file(path.clone())
            .map_err(|e| compile_error(*e, &path))?;
        let ast = Arc::new(ast);

        self.ast_cache
            .write()
            .insert(module.to_string(), Arc::clone(&ast));

        debug!(module, path = %path.display(), "Script compiled and cached");
        Ok(ast)
    }

    fn call(
        &self,
        ast: &AST,
        function: &str,
        arity: usize,
        ctx: &InterceptionContext,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let bridge = ctx.bridge();
        let req = ScriptRequest::new(Arc::clone(bridge.request()));
        let res = ScriptResponse::new(Arc::clone(bridge));
        let chain = ScriptChain::new(Arc::clone(bridge));

        let mut scope = Scope::new();
        match arity {
            0 => self.engine.call_fn(&mut scope, ast, function, ()),
            1 => self.engine.call_fn(&mut scope, ast, function, (req,)),
            2 => self.engine.call_fn(&mut scope, ast, function, (req, res)),
            _ => self.engine.call_fn(&mut scope, ast, function, (req, res, chain)),
        }
    }
}

fn optimization_level(level: i32) -> OptimizationLevel {
    match level {
        l if l < 0 => OptimizationLevel::None,
        0 => OptimizationLevel::Simple,
        _ => OptimizationLevel::Full,
    }
}

fn entry_arity(ast: &AST, function: &str) -> Option<usize> {
    ast.iter_functions()
        .filter(|f| f.name == function)
        .map(|f| f.params.len())
        .max()
}

fn compile_error(err: EvalAltResult, path: &Path) -> ScriptError {
    let script = Some(path.display().to_string());
    match err {
        EvalAltResult::ErrorParsing(kind, pos) => ScriptError::CompilationError {
            message: kind.to_string(),
            script,
            line: pos.line(),
            column: pos.position(),
        },
        other => {
            let pos = other.position();
            ScriptError::CompilationError {
                message: other.to_string(),
                script,
                line: pos.line(),
                column: pos.position(),
            }
        }
    }
}

/// Map an evaluation error to a script error
///
/// Signals are found by unwrapping nested function-call and module errors
/// down to the value that was thrown.
fn runtime_error(err: EvalAltResult, module_file: Option<&Path>) -> ScriptError {
    let mut stack = Vec::new();
    let mut script: Option<String> = None;
    let mut current = err;

    let innermost = loop {
        current = match current {
            EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) => {
                stack.push(frame(&name, &source, pos));
                if !source.is_empty() {
                    script = Some(source);
                }
                *inner
            }
            EvalAltResult::ErrorInModule(name, inner, pos) => {
                stack.push(match pos.line() {
                    Some(line) => format!("import \"{}\" (line {})", name, line),
                    None => format!("import \"{}\"", name),
                });
                *inner
            }
            other => break other,
        };
    };
    // Innermost frame first.
    stack.reverse();

    if let EvalAltResult::ErrorRuntime(value, _) = &innermost {
        match api::signal_of(value) {
            Some(Signal::Unhandled) => return ScriptError::Unhandled,
            Some(Signal::ChainReused) => return ScriptError::ChainAlreadyInvoked,
            None => {}
        }
    }

    let pos = innermost.position();
    let message = match innermost {
        EvalAltResult::ErrorRuntime(ref value, _) => api::describe_thrown(value),
        EvalAltResult::ErrorTooManyOperations(_) => {
            "script exceeded its operation budget".to_string()
        }
        mut other => {
            other.set_position(Position::NONE);
            other.to_string()
        }
    };

    ScriptError::RuntimeError {
        message,
        script: script.or_else(|| module_file.map(|p| p.display().to_string())),
        line: pos.line(),
        stack,
    }
}

fn frame(name: &str, source: &str, pos: Position) -> String {
    match (source.is_empty(), pos.line()) {
        (true, Some(line)) => format!("{}() (line {})", name, line),
        (true, None) => format!("{}()", name),
        (false, Some(line)) => format!("{}() ({} line {})", name, source, line),
        (false, None) => format!("{}() ({})", name, source),
    }
}

impl ScriptEngine for RhaiEngine {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn prepare(&self, module: &str) -> Result<()> {
        // Pre-compile and cache AST
        self.get_ast(module).map(|_| ())
    }

    fn invoke(&self, module: &str, function: &str, ctx: &InterceptionContext) -> Result<()> {
        let start = Instant::now();
        let ast = self.get_ast(module)?;
        let arity = entry_arity(&ast, function).ok_or_else(|| ScriptError::FunctionNotFound {
            module: module.to_string(),
            function: function.to_string(),
        })?;

        let value = self.call(&ast, function, arity, ctx).map_err(|e| {
            let module_file = self.module_file(module).ok();
            let err = runtime_error(*e, module_file.as_deref());
            if self.verbose && !err.stack().is_empty() {
                debug!(module, function, stack = ?err.stack(), "Script failed");
            }
            err
        })?;

        trace!(
            module,
            function,
            generation = ctx.generation(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Script invocation complete"
        );

        api::write_return_value(value, ctx.bridge())
    }

    fn cache_stats(&self) -> CacheStats {
        CacheStats {
            cached_scripts: self.ast_cache.read().len(),
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Builds [`RhaiEngine`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RhaiEngineFactory;

impl EngineFactory for RhaiEngineFactory {
    fn build(&self, settings: &EngineSettings) -> Result<Arc<dyn ScriptEngine>> {
        Ok(Arc::new(RhaiEngine::new(settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn settings(dir: &Path, source: &str) -> EngineSettings {
        let root = dir.join("app");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("config.rhai"), source).unwrap();
        EngineSettings {
            home: dir.to_path_buf(),
            module_roots: vec![root],
            module: "config".to_string(),
            function: "app".to_string(),
            optimization_level: 0,
            debug: false,
            verbose: true,
            strict_variables: true,
            max_operations: 10_000,
        }
    }

    #[test]
    fn test_entry_module_compiled_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RhaiEngine::new(&settings(dir.path(), "fn app(req, res, chain) { 1 }")).unwrap();

        assert_eq!(engine.language(), ScriptLanguage::Rhai);
        engine.prepare("config").unwrap();
        let stats = engine.cache_stats();
        assert_eq!(stats.cached_scripts, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_syntax_error_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let err = RhaiEngine::new(&settings(dir.path(), "fn app(req) {\n  let = ;\n}")).unwrap_err();
        match err {
            ScriptError::CompilationError { script, line, .. } => {
                assert!(script.unwrap().ends_with("config.rhai"));
                assert_eq!(line, Some(2));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_entry_function() {
        let dir = tempfile::tempdir().unwrap();
        let err = RhaiEngine::new(&settings(dir.path(), "fn other() {}")).unwrap_err();
        assert!(matches!(err, ScriptError::FunctionNotFound { .. }));
    }

    #[test]
    fn test_missing_module() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "fn app() {}");
        settings.module = "routes".to_string();
        let err = RhaiEngine::new(&settings).unwrap_err();
        assert!(matches!(err, ScriptError::ModuleNotFound { .. }));
    }

    #[test]
    fn test_optimization_level_mapping() {
        assert_eq!(optimization_level(-1), OptimizationLevel::None);
        assert_eq!(optimization_level(0), OptimizationLevel::Simple);
        assert_eq!(optimization_level(9), OptimizationLevel::Full);
    }

    #[test]
    fn test_runtime_error_unwraps_nested_calls() {
        let nested = EvalAltResult::ErrorInFunctionCall(
            "render".to_string(),
            "app/views.rhai".to_string(),
            Box::new(EvalAltResult::ErrorRuntime(
                Dynamic::from("boom".to_string()),
                Position::new(7, 3),
            )),
            Position::new(2, 1),
        );
        match runtime_error(nested, None) {
            ScriptError::RuntimeError {
                message,
                script,
                line,
                stack,
            } => {
                assert_eq!(message, "boom");
                assert_eq!(script.as_deref(), Some("app/views.rhai"));
                assert_eq!(line, Some(7));
                assert_eq!(stack, vec!["render() (app/views.rhai line 2)".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_nested_unhandled_signal_detected() {
        let nested = EvalAltResult::ErrorInModule(
            "routes".to_string(),
            Box::new(EvalAltResult::ErrorInFunctionCall(
                "dispatch".to_string(),
                String::new(),
                api::to_rhai(ScriptError::Unhandled),
                Position::NONE,
            )),
            Position::NONE,
        );
        assert!(runtime_error(nested, None).is_unhandled());
    }
}
