use crate::action::{Action, MouseButton, ScrollDirection};
use crate::agent::{env_setting, ActionOutcome, AgentError, Executor, Screen, Screenshot, StopHandle};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, warn};

/// How the model expresses coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordFormat {
    /// Decide from the model name.
    Auto,
    Absolute,
    /// 0..=1000 on both axes, scaled to the real screen.
    Normalized1000,
}

impl FromStr for CoordFormat {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(CoordFormat::Auto),
            "absolute" => Ok(CoordFormat::Absolute),
            "normalized_1000" | "normalized" => Ok(CoordFormat::Normalized1000),
            other => Err(AgentError::Config(format!(
                "COORD_FORMAT: unknown value '{other}', use auto, absolute or normalized_1000"
            ))),
        }
    }
}

impl CoordFormat {
    /// Qwen3-VL models answer on a 0..1000 grid; everything else is taken as pixels.
    pub fn resolve(self, model: &str) -> CoordFormat {
        match self {
            CoordFormat::Auto => {
                let m = model.to_ascii_lowercase();
                if m.contains("qwen3-vl") || m.contains("qwen3_vl") {
                    CoordFormat::Normalized1000
                } else {
                    CoordFormat::Absolute
                }
            }
            other => other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DesktopConfig {
    /// Program and arguments writing a PNG to stdout, or to `{path}` if that
    /// placeholder appears among the arguments.
    pub capture_command: Vec<String>,
    pub capture_mime: String,
    pub xdotool: String,
    pub coord_format: CoordFormat,
    pub failsafe: bool,
    pub failsafe_margin: i32,
    pub type_delay_ms: u64,
    /// Longest `wait` a model may ask for; longer ones are refused.
    pub max_wait: Duration,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        let capture = env::var("PILOT_CAPTURE_CMD")
            .unwrap_or_else(|_| "import -window root png:-".into());
        Self {
            capture_command: capture.split_whitespace().map(str::to_string).collect(),
            capture_mime: "image/png".into(),
            xdotool: env::var("PILOT_XDOTOOL").unwrap_or_else(|_| "xdotool".into()),
            coord_format: CoordFormat::Auto,
            failsafe: true,
            failsafe_margin: 2,
            type_delay_ms: 20,
            max_wait: Duration::from_secs(60),
        }
    }
}

impl DesktopConfig {
    pub fn from_env() -> Result<Self, AgentError> {
        let base = Self::default();
        Ok(Self {
            coord_format: env_setting("COORD_FORMAT", base.coord_format)?,
            failsafe: env_setting("PILOT_FAILSAFE", base.failsafe)?,
            type_delay_ms: env_setting("PILOT_TYPE_DELAY_MS", base.type_delay_ms)?,
            max_wait: Duration::from_millis(env_setting(
                "PILOT_MAX_WAIT_MS",
                base.max_wait.as_millis() as u64,
            )?),
            ..base
        })
    }
}

fn temp_capture_path() -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut p = env::temp_dir();
    p.push(format!("screen-pilot-{}-{}.png", std::process::id(), ts));
    p
}

// ========================= Observation =========================

/// Captures the display by running an external screenshot tool.
#[derive(Clone)]
pub struct CommandScreen {
    cfg: DesktopConfig,
}

impl CommandScreen {
    pub fn new(cfg: DesktopConfig) -> Self {
        Self { cfg }
    }

    async fn grab(&self) -> Result<Vec<u8>> {
        let (program, args) = self
            .cfg
            .capture_command
            .split_first()
            .context("capture command is empty")?;
        let path = args
            .iter()
            .any(|a| a.contains("{path}"))
            .then(temp_capture_path);
        let args: Vec<String> = match &path {
            Some(p) => {
                let p = p.display().to_string();
                args.iter().map(|a| a.replace("{path}", &p)).collect()
            }
            None => args.to_vec(),
        };

        let bytes = self.run_capture(program, &args, path.as_deref()).await;
        if let Some(p) = &path {
            let _ = tokio::fs::remove_file(p).await;
        }
        let bytes = bytes?;
        if bytes.is_empty() {
            bail!("{program} produced no image data");
        }
        Ok(bytes)
    }

    async fn run_capture(&self, program: &str, args: &[String], path: Option<&Path>) -> Result<Vec<u8>> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {program}"))?;
        if !output.status.success() {
            bail!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        match path {
            Some(p) => tokio::fs::read(p)
                .await
                .with_context(|| format!("failed to read {}", p.display())),
            None => Ok(output.stdout),
        }
    }
}

#[async_trait]
impl Screen for CommandScreen {
    async fn capture(&self) -> Result<Screenshot, AgentError> {
        let bytes = self
            .grab()
            .await
            .map_err(|e| AgentError::Capture(format!("{e:#}")))?;
        debug!(bytes = bytes.len(), "screen captured");
        Ok(Screenshot::new(self.cfg.capture_mime.clone(), STANDARD.encode(bytes)))
    }
}

// ========================= Execution =========================

/// Maps model key names onto X keysyms.
pub fn keysym(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let mapped = match lower.as_str() {
        "win" | "windows" | "super" | "cmd" | "command" | "meta" | "start" => "super",
        "ctrl" | "control" => "ctrl",
        "alt" | "option" => "alt",
        "shift" => "shift",
        "enter" | "return" => "Return",
        "esc" | "escape" => "Escape",
        "tab" => "Tab",
        "space" | "spacebar" => "space",
        "backspace" => "BackSpace",
        "delete" | "del" => "Delete",
        "insert" | "ins" => "Insert",
        "up" | "arrowup" => "Up",
        "down" | "arrowdown" => "Down",
        "left" | "arrowleft" => "Left",
        "right" | "arrowright" => "Right",
        "home" => "Home",
        "end" => "End",
        "pageup" | "page_up" | "pgup" => "Prior",
        "pagedown" | "page_down" | "pgdn" => "Next",
        "capslock" => "Caps_Lock",
        "printscreen" | "prtsc" => "Print",
        f if f.len() <= 3 && f.starts_with('f') && f[1..].parse::<u8>().is_ok() => {
            return f.to_ascii_uppercase();
        }
        _ => return name.trim().to_string(),
    };
    mapped.to_string()
}

/// Converts model coordinates into screen pixels, rejecting points off screen.
pub fn to_screen(
    format: CoordFormat,
    (x, y): (i32, i32),
    (width, height): (i32, i32),
) -> Result<(i32, i32), String> {
    let (sx, sy) = match format {
        CoordFormat::Normalized1000 => {
            if !(0..=1000).contains(&x) || !(0..=1000).contains(&y) {
                return Err(format!("coordinates ({x}, {y}) are outside the 0..1000 grid"));
            }
            let sx = (x as f64 / 1000.0 * width as f64).round() as i32;
            let sy = (y as f64 / 1000.0 * height as f64).round() as i32;
            (sx.min(width - 1), sy.min(height - 1))
        }
        _ => (x, y),
    };
    if sx < 0 || sy < 0 || sx >= width || sy >= height {
        return Err(format!(
            "coordinates ({x}, {y}) are outside the {width}x{height} screen"
        ));
    }
    Ok((sx, sy))
}

fn parse_geometry(out: &str) -> Option<(i32, i32)> {
    let mut it = out.split_whitespace().map(|t| t.parse::<i32>());
    match (it.next(), it.next()) {
        (Some(Ok(w)), Some(Ok(h))) if w > 0 && h > 0 => Some((w, h)),
        _ => None,
    }
}

fn parse_mouse_location(out: &str) -> Option<(i32, i32)> {
    let mut x = None;
    let mut y = None;
    for line in out.lines() {
        if let Some(v) = line.trim().strip_prefix("X=") {
            x = v.parse().ok();
        } else if let Some(v) = line.trim().strip_prefix("Y=") {
            y = v.parse().ok();
        }
    }
    Some((x?, y?))
}

fn button_code(button: MouseButton) -> &'static str {
    match button {
        MouseButton::Left => "1",
        MouseButton::Middle => "2",
        MouseButton::Right => "3",
    }
}

/// xdotool arguments for one input action, with coordinates already mapped.
fn input_args(action: &Action, point: Option<(i32, i32)>, type_delay_ms: u64) -> Option<Vec<String>> {
    let s = |v: &str| v.to_string();
    let args = match (action, point) {
        (Action::Move { .. }, Some((x, y))) => vec![s("mousemove"), x.to_string(), y.to_string()],
        (Action::Click { button, double, .. }, Some((x, y))) => {
            let mut v = vec![s("mousemove"), x.to_string(), y.to_string(), s("click")];
            if *double {
                v.extend([s("--repeat"), s("2")]);
            }
            v.push(s(button_code(*button)));
            v
        }
        (Action::TypeText { text }, _) => {
            vec![s("type"), s("--delay"), type_delay_ms.to_string(), s("--"), text.clone()]
        }
        (Action::KeyPress { key }, _) => vec![s("key"), s("--"), keysym(key)],
        (Action::Hotkey { keys }, _) => {
            let chord: Vec<String> = keys.iter().map(|k| keysym(k)).collect();
            vec![s("key"), s("--"), chord.join("+")]
        }
        (Action::Scroll { direction, amount }, _) => {
            let wheel = match direction {
                ScrollDirection::Up => "4",
                ScrollDirection::Down => "5",
                ScrollDirection::Left => "6",
                ScrollDirection::Right => "7",
            };
            vec![s("click"), s("--repeat"), amount.to_string(), s(wheel)]
        }
        _ => return None,
    };
    Some(args)
}

/// Drives the X display through `xdotool`.
pub struct XdotoolExecutor {
    cfg: DesktopConfig,
    format: CoordFormat,
    stop: Option<StopHandle>,
}

impl XdotoolExecutor {
    pub fn new(cfg: DesktopConfig, model: &str) -> Self {
        let format = cfg.coord_format.resolve(model);
        Self { cfg, format, stop: None }
    }

    /// The failsafe raises a stop on this handle when it trips.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn coord_format(&self) -> CoordFormat {
        self.format
    }

    async fn xdotool(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.cfg.xdotool)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.cfg.xdotool))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.cfg.xdotool,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn screen_size(&self) -> Result<(i32, i32)> {
        let out = self.xdotool(&["getdisplaygeometry".to_string()]).await?;
        parse_geometry(&out).with_context(|| format!("unexpected display geometry '{}'", out.trim()))
    }

    async fn pointer(&self) -> Result<(i32, i32)> {
        let out = self
            .xdotool(&["getmouselocation".to_string(), "--shell".to_string()])
            .await?;
        parse_mouse_location(&out).context("unexpected mouse location output")
    }

    async fn failsafe_tripped(&self) -> bool {
        if !self.cfg.failsafe {
            return false;
        }
        match self.pointer().await {
            Ok((x, y)) => x <= self.cfg.failsafe_margin && y <= self.cfg.failsafe_margin,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failsafe check skipped");
                false
            }
        }
    }

    async fn perform(&self, action: &Action) -> Result<String, String> {
        if let Action::Wait { ms } = action {
            let dur = Duration::from_millis(*ms);
            if dur > self.cfg.max_wait {
                return Err(format!(
                    "wait of {}s exceeds the {}s limit",
                    *ms as f64 / 1000.0,
                    self.cfg.max_wait.as_secs_f64()
                ));
            }
            match &self.stop {
                Some(stop) => {
                    stop.sleep(dur).await;
                }
                None => tokio::time::sleep(dur).await,
            }
            return Ok(format!("Waited {}s", *ms as f64 / 1000.0));
        }

        let point = match action {
            Action::Move { x, y } | Action::Click { x, y, .. } => {
                let size = self.screen_size().await.map_err(|e| format!("{e:#}"))?;
                Some(to_screen(self.format, (*x, *y), size)?)
            }
            _ => None,
        };
        let args = input_args(action, point, self.cfg.type_delay_ms)
            .ok_or_else(|| format!("{} is not an input action", action.kind()))?;
        self.xdotool(&args).await.map_err(|e| format!("{e:#}"))?;

        Ok(match (action, point) {
            (Action::Move { .. }, Some((x, y))) => format!("Moved pointer to ({x}, {y})"),
            (Action::Click { button, double, .. }, Some((x, y))) => {
                let kind = if *double { "Double-clicked" } else { "Clicked" };
                format!("{kind} {} at ({x}, {y})", button.as_str())
            }
            (Action::TypeText { text }, _) => format!("Typed {} characters", text.chars().count()),
            (Action::KeyPress { key }, _) => format!("Pressed {key}"),
            (Action::Hotkey { keys }, _) => format!("Pressed {}", keys.join("+")),
            (Action::Scroll { direction, amount }, _) => {
                format!("Scrolled {} by {amount}", direction.as_str())
            }
            _ => format!("Performed {action}"),
        })
    }
}

#[async_trait]
impl Executor for XdotoolExecutor {
    async fn execute(&self, action: &Action) -> ActionOutcome {
        if !action.is_executable() {
            return ActionOutcome::failed(format!("{} is not an input action", action.kind()));
        }
        if self.failsafe_tripped().await {
            warn!(action = %action, "failsafe: pointer in the top-left corner, halting");
            if let Some(stop) = &self.stop {
                stop.request_stop();
            }
            return ActionOutcome::failed("Failsafe triggered: pointer moved to the top-left corner");
        }
        match self.perform(action).await {
            Ok(msg) => ActionOutcome::ok(msg),
            Err(msg) => ActionOutcome::failed(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_map_to_keysyms() {
        assert_eq!(keysym("win"), "super");
        assert_eq!(keysym("Enter"), "Return");
        assert_eq!(keysym("esc"), "Escape");
        assert_eq!(keysym("PageDown"), "Next");
        assert_eq!(keysym("f5"), "F5");
        assert_eq!(keysym("a"), "a");
        assert_eq!(keysym("XF86AudioMute"), "XF86AudioMute");
    }

    #[test]
    fn coordinate_formats() {
        assert_eq!(CoordFormat::Auto.resolve("qwen3-vl:8b"), CoordFormat::Normalized1000);
        assert_eq!(CoordFormat::Auto.resolve("Qwen3-VL-Flash"), CoordFormat::Normalized1000);
        assert_eq!(CoordFormat::Auto.resolve("llava:13b"), CoordFormat::Absolute);
        assert_eq!(CoordFormat::Absolute.resolve("qwen3-vl:8b"), CoordFormat::Absolute);
        assert_eq!("normalized_1000".parse::<CoordFormat>().unwrap(), CoordFormat::Normalized1000);
        assert!(matches!("pixels".parse::<CoordFormat>(), Err(AgentError::Config(_))));
    }

    #[test]
    fn scaling_and_bounds() {
        let screen = (1920, 1080);
        assert_eq!(to_screen(CoordFormat::Normalized1000, (500, 500), screen), Ok((960, 540)));
        assert_eq!(to_screen(CoordFormat::Normalized1000, (1000, 1000), screen), Ok((1919, 1079)));
        assert!(to_screen(CoordFormat::Normalized1000, (1200, 10), screen).is_err());
        assert_eq!(to_screen(CoordFormat::Absolute, (100, 200), screen), Ok((100, 200)));
        assert!(to_screen(CoordFormat::Absolute, (1920, 5), screen).is_err());
        assert!(to_screen(CoordFormat::Absolute, (-1, 5), screen).is_err());
    }

    #[test]
    fn xdotool_output_parsing() {
        assert_eq!(parse_geometry("1920 1080\n"), Some((1920, 1080)));
        assert_eq!(parse_geometry("garbage"), None);
        let loc = "X=0\nY=1\nSCREEN=0\nWINDOW=123\n";
        assert_eq!(parse_mouse_location(loc), Some((0, 1)));
        assert_eq!(parse_mouse_location("X=5\n"), None);
    }

    #[test]
    fn input_arguments() {
        let click = Action::Click { x: 1, y: 2, button: MouseButton::Right, double: true };
        assert_eq!(
            input_args(&click, Some((10, 20)), 20).unwrap(),
            ["mousemove", "10", "20", "click", "--repeat", "2", "3"]
        );
        let hotkey = Action::Hotkey { keys: vec!["win".into(), "r".into()] };
        assert_eq!(input_args(&hotkey, None, 20).unwrap(), ["key", "--", "super+r"]);
        let typed = Action::TypeText { text: "-notepad".into() };
        assert_eq!(
            input_args(&typed, None, 15).unwrap(),
            ["type", "--delay", "15", "--", "-notepad"]
        );
        let scroll = Action::Scroll { direction: ScrollDirection::Down, amount: 3 };
        assert_eq!(input_args(&scroll, None, 20).unwrap(), ["click", "--repeat", "3", "5"]);
        assert!(input_args(&Action::Done { message: String::new() }, None, 20).is_none());
    }

    #[tokio::test]
    async fn terminal_actions_are_not_executed() {
        let exec = XdotoolExecutor::new(DesktopConfig { failsafe: false, ..DesktopConfig::default() }, "m");
        let out = exec.execute(&Action::Done { message: "x".into() }).await;
        assert!(!out.success);
    }

    #[tokio::test]
    async fn overlong_wait_is_refused() {
        let cfg = DesktopConfig {
            failsafe: false,
            max_wait: Duration::from_millis(50),
            ..DesktopConfig::default()
        };
        let exec = XdotoolExecutor::new(cfg, "m");
        let started = std::time::Instant::now();
        let out = exec.execute(&Action::Wait { ms: 86_400_000 }).await;
        assert!(!out.success);
        assert!(out.message.contains("exceeds"));
        assert!(started.elapsed() < Duration::from_secs(5));

        let out = exec.execute(&Action::Wait { ms: 10 }).await;
        assert!(out.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_capture_removes_temp_file() {
        let marker = env::temp_dir().join(format!("screen-pilot-capture-test-{}", std::process::id()));
        let script = format!("echo $1 > {}; touch $1; exit 3", marker.display());
        let cfg = DesktopConfig {
            capture_command: vec!["sh".into(), "-c".into(), script, "sh".into(), "{path}".into()],
            ..DesktopConfig::default()
        };
        let err = CommandScreen::new(cfg).capture().await.unwrap_err();
        assert!(matches!(err, AgentError::Capture(_)));

        let written = std::fs::read_to_string(&marker).unwrap();
        let _ = std::fs::remove_file(&marker);
        let temp = PathBuf::from(written.trim());
        assert!(temp.starts_with(env::temp_dir()));
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn missing_capture_tool_is_capture_error() {
        let cfg = DesktopConfig {
            capture_command: vec!["/nonexistent/screen-pilot-capture".into()],
            ..DesktopConfig::default()
        };
        let err = CommandScreen::new(cfg).capture().await.unwrap_err();
        assert!(matches!(err, AgentError::Capture(_)));
    }
}
