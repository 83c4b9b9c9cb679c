//! stemline - render or play a multi-stem song
//!
//! ```text
//! stemline render --out mix.wav [--speed S] [--reverb] [--whammy P] [--chipmunk] <stem>=<file>...
//! stemline play [--speed S] [--reverb] [--seconds N] <stem>=<file>...
//! stemline devices
//! ```
//!
//! Stems given the same file share one decode source through split streams.
//! Set RUST_LOG=debug for verbose output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use stemline_core::audio::{output_device_names, start_output};
use stemline_core::backend::software::{BackendRenderer, SoftwareBackend};
use stemline_core::backend::{DecodeBackend, StreamHandle};
use stemline_core::config::{default_config_path, load_config, EngineConfig, SettingsManager};
use stemline_core::engine::{
    channel_ref, ChannelContext, FadeOut, MainThreadDispatcher, StemChannel, StemMixer,
};
use stemline_core::types::{SongStem, StereoBuffer};

const RENDER_BLOCK: usize = 1024;
const CONTROL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Render,
    Play,
    Devices,
}

#[derive(Debug)]
struct Args {
    command: Command,
    out: Option<PathBuf>,
    config: Option<PathBuf>,
    speed: f32,
    reverb: bool,
    whammy: Option<f32>,
    chipmunk: bool,
    seconds: Option<f64>,
    stems: Vec<(SongStem, PathBuf)>,
}

fn usage() -> &'static str {
    "usage:\n  stemline render --out <file.wav> [--speed S] [--reverb] [--whammy P] [--chipmunk] [--config <file>] <stem>=<file>...\n  stemline play [--speed S] [--reverb] [--seconds N] [--config <file>] <stem>=<file>...\n  stemline devices"
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut iter = args.iter();
    let command = match iter.next().map(String::as_str) {
        Some("render") => Command::Render,
        Some("play") => Command::Play,
        Some("devices") => Command::Devices,
        _ => bail!("{}", usage()),
    };

    let mut parsed = Args {
        command,
        out: None,
        config: None,
        speed: 1.0,
        reverb: false,
        whammy: None,
        chipmunk: false,
        seconds: None,
        stems: Vec::new(),
    };

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "--out" => parsed.out = Some(PathBuf::from(value("--out")?)),
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--speed" => parsed.speed = value("--speed")?.parse().context("invalid --speed")?,
            "--whammy" => parsed.whammy = Some(value("--whammy")?.parse().context("invalid --whammy")?),
            "--seconds" => parsed.seconds = Some(value("--seconds")?.parse().context("invalid --seconds")?),
            "--reverb" => parsed.reverb = true,
            "--chipmunk" => parsed.chipmunk = true,
            other if other.starts_with("--") => bail!("unknown option {}\n{}", other, usage()),
            stem_arg => {
                let (stem, path) = stem_arg
                    .split_once('=')
                    .with_context(|| format!("expected <stem>=<file>, got {}", stem_arg))?;
                let stem: SongStem = stem.parse()?;
                parsed.stems.push((stem, PathBuf::from(path)));
            }
        }
    }

    if parsed.stems.is_empty() && parsed.command != Command::Devices {
        bail!("no stems given\n{}", usage());
    }
    if parsed.command == Command::Render && parsed.out.is_none() {
        bail!("render needs --out <file.wav>");
    }
    Ok(parsed)
}

/// A loaded song: the mixer plus the shared sources the session owns
struct Session {
    backend: Arc<SoftwareBackend>,
    /// Moves to the output callback or the offline render loop
    renderer: Option<BackendRenderer>,
    dispatcher: MainThreadDispatcher,
    mixer: StemMixer,
    shared_sources: Vec<StreamHandle>,
    finished: Arc<AtomicBool>,
}

impl Session {
    fn open(args: &Args, config: EngineConfig) -> Result<Self> {
        let (backend, renderer) = SoftwareBackend::new(config.output.sample_rate);
        let backend = Arc::new(backend);
        let settings = Arc::new(SettingsManager::new(config));
        if args.chipmunk {
            settings.update_options(|o| o.chipmunk_speedup = true);
        }

        let dispatcher = MainThreadDispatcher::new();
        let context = ChannelContext {
            backend: backend.clone(),
            manager: settings,
            dispatch: dispatcher.handle(),
        };

        // Files used by more than one stem are decoded once and split
        let mut uses: HashMap<&Path, usize> = HashMap::new();
        for (_, path) in &args.stems {
            *uses.entry(path.as_path()).or_default() += 1;
        }

        let mut shared: HashMap<&Path, StreamHandle> = HashMap::new();
        let mut mixer = StemMixer::new();
        for (stem, path) in &args.stems {
            let channel = if uses[path.as_path()] > 1 {
                let source = match shared.get(path.as_path()) {
                    Some(source) => *source,
                    None => {
                        let source = backend
                            .create_stream(path)
                            .with_context(|| format!("failed to open {}", path.display()))?;
                        shared.insert(path.as_path(), source);
                        source
                    }
                };
                StemChannel::from_source(&context, *stem, source, true)
            } else {
                StemChannel::new(&context, path.clone(), *stem)
            };
            mixer.add(channel_ref(channel));
        }

        let mut session = Self {
            backend,
            renderer: Some(renderer),
            dispatcher,
            mixer,
            shared_sources: shared.into_values().collect(),
            finished: Arc::new(AtomicBool::new(false)),
        };

        for (stem, error) in session.mixer.load_all(args.speed) {
            log::warn!("Skipping {} (status {}): {}", stem, error.status_code(), error);
        }
        session.drop_unloaded();
        if session.mixer.is_empty() {
            session.close();
            bail!("no stem could be loaded");
        }

        session.plug_into_output()?;

        if args.reverb {
            for (stem, _) in &args.stems {
                session.mixer.set_reverb(*stem, true);
            }
        }
        if let Some(percent) = args.whammy {
            for (stem, _) in &args.stems {
                session.mixer.set_whammy_pitch(*stem, percent);
            }
        }

        let finished = session.finished.clone();
        session.mixer.subscribe_song_end(Arc::new(move || {
            log::info!("Song finished");
            finished.store(true, Ordering::SeqCst);
        }));

        log::info!(
            "Loaded {} stems, {:.1}s at speed {}",
            session.mixer.len(),
            session.mixer.length_seconds(),
            session.mixer.speed()
        );
        Ok(session)
    }

    fn drop_unloaded(&mut self) {
        let unloaded: Vec<_> = self
            .mixer
            .channels()
            .filter(|c| !c.lock().map(|c| c.is_loaded()).unwrap_or(false))
            .cloned()
            .collect();
        for channel in unloaded {
            self.mixer.remove(&channel);
            if let Ok(mut channel) = channel.lock() {
                channel.dispose();
            }
        }
    }

    /// Plug both paths of every channel into the backend mixer
    fn plug_into_output(&mut self) -> Result<()> {
        for channel in self.mixer.channels() {
            let mut channel = channel
                .lock()
                .map_err(|_| anyhow::anyhow!("channel lock poisoned"))?;
            for stream in [channel.stream_handle(), channel.reverb_stream_handle()]
                .into_iter()
                .flatten()
            {
                self.backend.mixer_add(stream)?;
            }
            channel.set_mixed(true);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        for channel in self.mixer.channels() {
            if let Ok(mut channel) = channel.lock() {
                channel.dispose();
            }
        }
        for source in self.shared_sources.drain(..) {
            if let Err(e) = self.backend.stream_free(source) {
                log::warn!("Failed to free shared source {}: {}", source, e);
            }
        }
    }
}

fn render(args: &Args, config: EngineConfig) -> Result<()> {
    let out_path = args.out.as_deref().context("render needs --out")?;
    let sample_rate = config.output.sample_rate;
    let mut session = Session::open(args, config)?;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(out_path, spec)
        .with_context(|| format!("failed to create {}", out_path.display()))?;

    // Bound the render in case an end sync never arrives
    let expected = session.mixer.length_seconds() / session.mixer.speed().max(0.05) as f64;
    let max_frames = ((expected + 5.0) * sample_rate as f64) as u64;

    let mut renderer = session.renderer.take().context("renderer already taken")?;
    let mut block = StereoBuffer::silence(RENDER_BLOCK);
    let mut rendered = 0u64;
    while !session.is_finished() && rendered < max_frames {
        renderer.render(&mut block);
        for sample in block.iter() {
            writer.write_sample(sample.left)?;
            writer.write_sample(sample.right)?;
        }
        rendered += block.len() as u64;
        session.dispatcher.run_pending();
        session.mixer.tick();
    }

    writer.finalize()?;
    session.close();

    if !session.is_finished() {
        log::warn!("Render stopped after {:.1}s without an end of stream", rendered as f64 / sample_rate as f64);
    }
    log::info!(
        "Wrote {:.1}s to {}",
        rendered as f64 / sample_rate as f64,
        out_path.display()
    );
    Ok(())
}

fn play(args: &Args, config: EngineConfig) -> Result<()> {
    let output_config = config.output.clone();
    let mut session = Session::open(args, config)?;
    let renderer = session.renderer.take().context("renderer already taken")?;
    let output = start_output(renderer, &output_config)?;
    log::info!(
        "Playing on {} at {}Hz ({} frames, {:.1}ms)",
        output.device_name(),
        output.sample_rate(),
        output.buffer_size(),
        output.latency_ms()
    );

    let started = Instant::now();
    let mut fades: Option<Vec<FadeOut>> = None;

    while !session.is_finished() {
        session.dispatcher.run_timeout(CONTROL_TICK);
        session.mixer.tick();

        if let Some(fades) = fades.as_mut() {
            if fades.iter_mut().all(|f| f.try_outcome().is_some()) {
                log::info!("Faded out");
                break;
            }
        } else if args
            .seconds
            .is_some_and(|limit| started.elapsed().as_secs_f64() >= limit)
        {
            log::info!("Stopping at {:.1}s", session.mixer.position());
            fades = Some(session.mixer.fade_out_all());
        }
    }

    session.close();
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path("config.yaml"));
    let config: EngineConfig = load_config(&config_path);

    match args.command {
        Command::Render => render(&args, config),
        Command::Play => play(&args, config),
        Command::Devices => {
            for name in output_device_names()? {
                println!("{}", name);
            }
            Ok(())
        }
    }
}
