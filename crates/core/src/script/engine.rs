//! Rhai-backed effect scripts.
//!
//! A script defines `fn update(colors)` or `fn update(colors, fft)` and may
//! use the following host API:
//! - `Color()` / `Color(r, g, b)` - detached color with `red`, `green`, `blue`
//! - `colors.len`, `colors.get(i)`, `colors.set(i, c)`, `colors.append(c)`,
//!   `colors[i]`, `for color in colors { ... }`
//! - `fft_result()` - read-only spectrum of the current frame
//! - `rusty(n)` - returns `2 * n`
//!
//! Channel setters clamp to the configured bounds, so `color.red += 1` on a
//! saturated pixel leaves it at the maximum.

use std::{
    cell::{Cell, RefCell},
    fmt, fs,
    path::{Path, PathBuf},
    rc::Rc,
    time::{Duration, Instant},
};

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Position, Scope, AST, FLOAT, INT};

use super::{rusty, FrameScript, Invocation};
use crate::{
    BridgeError, Channel, ChannelBounds, Color, ColorBufferView, PixelRef, Result, ScriptConfig,
    ScriptReturn, SnapshotView,
};

const SCRIPT_TARGET: &str = "turbo_bridge::script";

/// Budget for running top-level statements and helper functions outside a frame.
const LOAD_BUDGET: Duration = Duration::from_secs(1);

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// State the registered functions read during an invocation.
#[derive(Default)]
struct FrameGlobals {
    deadline: Cell<Option<Instant>>,
    spectrum: RefCell<Option<SnapshotView>>,
}

impl FrameGlobals {
    fn enter(self: &Rc<Self>, deadline: Instant, spectrum: Option<SnapshotView>) -> FrameGuard {
        self.deadline.set(Some(deadline));
        *self.spectrum.borrow_mut() = spectrum;
        FrameGuard {
            globals: self.clone(),
        }
    }
}

/// Clears the per-frame state even if the call unwinds.
struct FrameGuard {
    globals: Rc<FrameGlobals>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.globals.deadline.set(None);
        self.globals.spectrum.borrow_mut().take();
    }
}

pub struct RhaiScript {
    engine: Engine,
    ast: AST,
    arity: usize,
    globals: Rc<FrameGlobals>,
    config: ScriptConfig,
    bounds: ChannelBounds,
    path: Option<PathBuf>,
}

impl RhaiScript {
    /// Compiles `source` and runs its top-level statements once.
    pub fn compile(source: &str, config: &ScriptConfig, bounds: ChannelBounds) -> Result<Self> {
        let globals = Rc::new(FrameGlobals::default());
        let engine = build_engine(config, bounds, globals.clone());
        let ast = engine
            .compile(source)
            .map_err(|err| BridgeError::Compile(err.to_string()))?;
        let arity = entry_arity(&ast, &config.entry_point)?;

        {
            let _load = globals.enter(Instant::now() + LOAD_BUDGET, None);
            engine
                .run_ast(&ast)
                .map_err(|err| BridgeError::Compile(format!("top-level statements failed: {err}")))?;
        }

        Ok(Self {
            engine,
            ast,
            arity,
            globals,
            config: config.clone(),
            bounds,
            path: None,
        })
    }

    pub fn from_path(
        path: impl AsRef<Path>,
        config: &ScriptConfig,
        bounds: ChannelBounds,
    ) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        let mut script = Self::compile(&source, config, bounds)?;
        script.path = Some(path.to_path_buf());
        tracing::info!(path = %path.display(), arity = script.arity, "loaded script");
        Ok(script)
    }

    /// Re-reads the source file. On failure the current script stays active.
    pub fn reload(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Err(BridgeError::msg("script was not loaded from a file"));
        };

        match Self::from_path(&path, &self.config, self.bounds) {
            Ok(fresh) => {
                *self = fresh;
                Ok(())
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "reload failed, keeping previous script");
                Err(err)
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of parameters the entry point takes (1 or 2).
    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == name)
    }

    /// Calls a zero-argument helper such as `example()` and renders its result.
    pub fn call_helper(&self, name: &str) -> Result<Option<String>> {
        if !self.ast.iter_functions().any(|f| f.name == name && f.params.is_empty()) {
            return Ok(None);
        }

        let _helper = self.globals.enter(Instant::now() + LOAD_BUDGET, None);
        let mut scope = Scope::new();
        let value = self
            .engine
            .call_fn_with_options::<Dynamic>(
                CallFnOptions::new().eval_ast(false),
                &mut scope,
                &self.ast,
                name,
                (),
            )
            .map_err(|err| BridgeError::ScriptFault(err.to_string()))?;
        Ok(Some(value.to_string()))
    }

    fn interpret_return(&self, value: Dynamic, colors: &ColorBufferView) -> Result<ScriptReturn> {
        if value.is_unit() {
            return Ok(ScriptReturn::InPlace);
        }

        if value.is::<ColorBufferView>() {
            return match value.try_cast::<ColorBufferView>() {
                Some(view) if view.same_buffer(colors) => Ok(ScriptReturn::InPlace),
                _ => Err(BridgeError::ScriptFault(
                    "entry point returned a buffer that does not belong to this frame".to_string(),
                )),
            };
        }

        if value.is_array() {
            let items = value
                .into_array()
                .map_err(|ty| BridgeError::ScriptFault(format!("unreadable array: {ty}")))?;
            let colors = items
                .into_iter()
                .enumerate()
                .map(|(index, item)| color_from_dynamic(index, item))
                .collect::<Result<Vec<_>>>()?;
            return Ok(ScriptReturn::Replaced(colors));
        }

        Err(BridgeError::ScriptFault(format!(
            "`{}` must return the color buffer, got {}",
            self.config.entry_point,
            value.type_name()
        )))
    }
}

impl FrameScript for RhaiScript {
    fn invoke(&mut self, invocation: &Invocation) -> Result<ScriptReturn> {
        let _frame = self
            .globals
            .enter(invocation.deadline(), Some(invocation.spectrum.clone()));
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false);
        let entry = self.config.entry_point.as_str();
        let colors = invocation.colors.clone();

        let result = if self.arity >= 2 {
            self.engine.call_fn_with_options::<Dynamic>(
                options,
                &mut scope,
                &self.ast,
                entry,
                (colors, invocation.spectrum.clone()),
            )
        } else {
            self.engine
                .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, entry, (colors,))
        };

        match result {
            Ok(value) => self.interpret_return(value, &invocation.colors),
            Err(err) if is_termination(&err) => Err(BridgeError::BudgetExceeded {
                elapsed: invocation.started.elapsed(),
                budget: invocation.budget,
            }),
            Err(err) => Err(BridgeError::ScriptFault(err.to_string())),
        }
    }
}

impl fmt::Debug for RhaiScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhaiScript")
            .field("entry_point", &self.config.entry_point)
            .field("arity", &self.arity)
            .field("path", &self.path)
            .finish()
    }
}

fn entry_arity(ast: &AST, entry_point: &str) -> Result<usize> {
    ast.iter_functions()
        .filter(|f| f.name == entry_point)
        .map(|f| f.params.len())
        .filter(|arity| (1..=2).contains(arity))
        .max()
        .ok_or_else(|| {
            BridgeError::Compile(format!(
                "script does not define `{entry_point}(colors)` or `{entry_point}(colors, fft)`"
            ))
        })
}

fn is_termination(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_termination(inner),
        _ => false,
    }
}

fn color_from_dynamic(index: usize, item: Dynamic) -> Result<Color> {
    let type_name = item.type_name();
    if let Some(pixel) = item.clone().try_cast::<PixelRef>() {
        return pixel.get();
    }
    item.try_cast::<Color>().ok_or_else(|| {
        BridgeError::ScriptFault(format!(
            "element {index} of the returned array is {type_name}, not a Color"
        ))
    })
}

fn script_error(err: BridgeError) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(err.to_string()), Position::NONE).into()
}

fn build_engine(config: &ScriptConfig, bounds: ChannelBounds, globals: Rc<FrameGlobals>) -> Engine {
    let mut engine = Engine::new();

    // The progress watchdog cannot interrupt a single large allocation.
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);

    engine.on_print(|text| tracing::info!(target: SCRIPT_TARGET, "{text}"));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: SCRIPT_TARGET, source = source.unwrap_or(""), %pos, "{text}")
    });

    let interval = config.progress_interval.max(1);
    let watchdog = globals.clone();
    engine.on_progress(move |operations| {
        if operations % interval != 0 {
            return None;
        }
        match watchdog.deadline.get() {
            Some(deadline) if Instant::now() >= deadline => Some(Dynamic::UNIT),
            _ => None,
        }
    });

    register_color(&mut engine, bounds);
    register_pixel(&mut engine);
    register_buffer(&mut engine);
    register_spectrum(&mut engine, globals);

    engine.register_fn("rusty", |value: INT| -> ScriptResult<INT> {
        rusty(value).ok_or_else(|| script_error(BridgeError::msg("rusty() overflowed")))
    });

    engine
}

fn register_color(engine: &mut Engine, bounds: ChannelBounds) {
    engine
        .register_type_with_name::<Color>("Color")
        .register_fn("Color", Color::default)
        .register_fn("Color", move |red: INT, green: INT, blue: INT| {
            Color::from_raw(red, green, blue, bounds)
        })
        .register_fn("to_string", |color: &mut Color| color.to_string())
        .register_fn("to_debug", |color: &mut Color| format!("Color{color}"));

    for channel in Channel::ALL {
        engine.register_get(channel.name(), move |color: &mut Color| {
            INT::from(color.channel(channel))
        });
        engine.register_set(channel.name(), move |color: &mut Color, value: INT| {
            *color.channel_mut(channel) = bounds.clamp(value);
        });
    }
}

fn register_pixel(engine: &mut Engine) {
    engine
        .register_type_with_name::<PixelRef>("Pixel")
        .register_get("index", |pixel: &mut PixelRef| pixel.index() as INT)
        .register_fn("get", |pixel: &mut PixelRef| -> ScriptResult<Color> {
            pixel.get().map_err(script_error)
        })
        .register_fn("set", |pixel: &mut PixelRef, color: Color| -> ScriptResult<()> {
            pixel.set(color).map_err(script_error)
        })
        .register_fn("to_string", |pixel: &mut PixelRef| match pixel.get() {
            Ok(color) => color.to_string(),
            Err(_) => "(expired)".to_string(),
        });

    for channel in Channel::ALL {
        engine.register_get(channel.name(), move |pixel: &mut PixelRef| -> ScriptResult<INT> {
            pixel.channel(channel).map(INT::from).map_err(script_error)
        });
        engine.register_set(
            channel.name(),
            move |pixel: &mut PixelRef, value: INT| -> ScriptResult<()> {
                pixel
                    .set_channel(channel, value)
                    .map(|_| ())
                    .map_err(script_error)
            },
        );
    }
}

fn register_buffer(engine: &mut Engine) {
    let len = |colors: &mut ColorBufferView| -> ScriptResult<INT> {
        colors.len().map(|len| len as INT).map_err(script_error)
    };
    let append = |colors: &mut ColorBufferView, color: Color| -> ScriptResult<()> {
        colors.append(color).map_err(script_error)
    };

    engine
        .register_type_with_name::<ColorBufferView>("ColorBuffer")
        .register_iterator::<ColorBufferView>()
        .register_fn("len", len)
        .register_get("len", len)
        .register_fn("is_empty", |colors: &mut ColorBufferView| -> ScriptResult<bool> {
            colors.is_empty().map_err(script_error)
        })
        .register_fn("get", |colors: &mut ColorBufferView, index: INT| -> ScriptResult<Color> {
            colors.get(index).map_err(script_error)
        })
        .register_fn(
            "set",
            |colors: &mut ColorBufferView, index: INT, color: Color| -> ScriptResult<()> {
                colors.set(index, color).map_err(script_error)
            },
        )
        .register_fn("append", append)
        .register_fn("push", append)
        .register_indexer_get(
            |colors: &mut ColorBufferView, index: INT| -> ScriptResult<PixelRef> {
                colors.pixel(index).map_err(script_error)
            },
        )
        .register_indexer_set(
            |colors: &mut ColorBufferView, index: INT, color: Color| -> ScriptResult<()> {
                colors.set(index, color).map_err(script_error)
            },
        )
        // Write-back after `colors[i].red = x`; the pixel already wrote through.
        .register_indexer_set(
            |colors: &mut ColorBufferView, index: INT, pixel: PixelRef| -> ScriptResult<()> {
                let color = pixel.get().map_err(script_error)?;
                colors.set(index, color).map_err(script_error)
            },
        )
        .register_fn("to_string", |colors: &mut ColorBufferView| {
            format!("ColorBuffer({} pixels)", colors.len().unwrap_or(0))
        });
}

fn register_spectrum(engine: &mut Engine, globals: Rc<FrameGlobals>) {
    let max_amplitude = |fft: &mut SnapshotView| FLOAT::from(fft.max_amplitude());
    let refuse_float = |fft: &mut SnapshotView, _value: FLOAT| -> ScriptResult<()> {
        fft.assign("max_amplitude").map_err(script_error)
    };

    engine
        .register_type_with_name::<SnapshotView>("FftResult")
        .register_fn("get_max_amplitude", max_amplitude)
        .register_fn("getMaxAmplitude", max_amplitude)
        .register_get("max_amplitude", max_amplitude)
        .register_set("max_amplitude", refuse_float)
        .register_fn("len", |fft: &mut SnapshotView| fft.len() as INT)
        .register_get("len", |fft: &mut SnapshotView| fft.len() as INT)
        .register_fn("bin", |fft: &mut SnapshotView, index: INT| -> ScriptResult<FLOAT> {
            fft.bin(index).map(FLOAT::from).map_err(script_error)
        })
        .register_indexer_get(|fft: &mut SnapshotView, index: INT| -> ScriptResult<FLOAT> {
            fft.bin(index).map(FLOAT::from).map_err(script_error)
        })
        .register_indexer_set(
            |fft: &mut SnapshotView, _index: INT, _value: FLOAT| -> ScriptResult<()> {
                fft.assign("bin").map_err(script_error)
            },
        )
        .register_indexer_set(
            |fft: &mut SnapshotView, _index: INT, _value: INT| -> ScriptResult<()> {
                fft.assign("bin").map_err(script_error)
            },
        )
        .register_fn("get_max_frequency", |fft: &mut SnapshotView| {
            FLOAT::from(fft.max_frequency())
        })
        .register_fn("get_frequency_amplitude", |fft: &mut SnapshotView, hz: FLOAT| {
            frequency_amplitude(fft, hz)
        })
        .register_fn("get_frequency_amplitude", |fft: &mut SnapshotView, hz: INT| {
            frequency_amplitude(fft, hz as FLOAT)
        })
        .register_fn(
            "get_average_amplitude",
            |fft: &mut SnapshotView, lower: FLOAT, upper: FLOAT| average_amplitude(fft, lower, upper),
        )
        .register_fn(
            "get_average_amplitude",
            |fft: &mut SnapshotView, lower: INT, upper: INT| {
                average_amplitude(fft, lower as FLOAT, upper as FLOAT)
            },
        )
        .register_fn("to_string", |fft: &mut SnapshotView| {
            format!("FftResult({} bins, max {})", fft.len(), fft.max_amplitude())
        });

    engine.register_set("max_amplitude", |fft: &mut SnapshotView, _value: INT| -> ScriptResult<()> {
        fft.assign("max_amplitude").map_err(script_error)
    });

    engine.register_fn("fft_result", move || -> ScriptResult<SnapshotView> {
        globals.spectrum.borrow().clone().ok_or_else(|| {
            script_error(BridgeError::ViewUnavailable(
                "fft_result() is only available while a frame is running",
            ))
        })
    });
}

fn frequency_amplitude(fft: &SnapshotView, hz: FLOAT) -> FLOAT {
    match fft.frequency_amplitude(hz as f32) {
        Some(amplitude) => FLOAT::from(amplitude),
        None => {
            tracing::warn!(target: SCRIPT_TARGET, hz, "frequency outside the analysed range");
            0.0
        }
    }
}

fn average_amplitude(fft: &SnapshotView, lower: FLOAT, upper: FLOAT) -> FLOAT {
    match fft.average_amplitude(lower as f32, upper as f32) {
        Some(amplitude) => FLOAT::from(amplitude),
        None => {
            tracing::warn!(target: SCRIPT_TARGET, lower, upper, "invalid frequency band");
            0.0
        }
    }
}
