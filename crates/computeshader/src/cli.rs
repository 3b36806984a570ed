use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "computeshader",
    author,
    version,
    about = "Interactive GPU compute-shader sandbox",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scene file, or a scene name searched in the user scene directories.
    #[arg(value_name = "SCENE")]
    pub scene: Option<String>,

    #[command(flatten)]
    pub scene_args: SceneArgs,

    /// Do not watch shader sources for changes (the `R` key still reloads).
    #[arg(long)]
    pub no_watch: bool,

    /// Presentation sync: `on` waits for vertical blank, `off` presents immediately.
    #[arg(long, value_name = "MODE", value_parser = parse_toggle, default_value = "on")]
    pub vsync: bool,
}

#[derive(Args, Debug, Default, Clone)]
pub struct SceneArgs {
    /// Override the window size (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Seed for randomly initialised buffers.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub seed: u64,

    /// Override a parameter's initial value; repeatable (e.g. `--set MoveSpeed=40`).
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    pub overrides: Vec<(String, String)>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile every program and run frames on the headless backend.
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(value_name = "SCENE")]
    pub scene: String,

    /// Number of frames to run.
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub frames: u32,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub scene_args: SceneArgs,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X', '×'])
        .ok_or_else(|| "expected WxH format, e.g. 1920x1080".to_string())?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{}'", width.trim()))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{}'", height.trim()))?;
    if width == 0 || height == 0 {
        return Err("window dimensions must be greater than zero".to_string());
    }
    Ok((width, height))
}

pub fn parse_assignment(value: &str) -> Result<(String, String), String> {
    let (name, raw) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{value}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("parameter name must not be empty".to_string());
    }
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(format!("parameter '{name}' needs a value"));
    }
    Ok((name.to_string(), raw.to_string()))
}

pub fn parse_toggle(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(format!("unknown mode '{other}'; expected on or off")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_accepts_common_separators() {
        assert_eq!(parse_size("1280x720").unwrap(), (1280, 720));
        assert_eq!(parse_size(" 800 X 600 ").unwrap(), (800, 600));
        assert_eq!(parse_size("640×480").unwrap(), (640, 480));
    }

    #[test]
    fn size_rejects_zero_and_garbage() {
        assert!(parse_size("0x720").is_err());
        assert!(parse_size("1280").is_err());
        assert!(parse_size("widexhigh").is_err());
    }

    #[test]
    fn assignment_splits_on_first_equals() {
        assert_eq!(
            parse_assignment("Tint=1,0,0,1").unwrap(),
            ("Tint".to_string(), "1,0,0,1".to_string())
        );
        assert!(parse_assignment("=3").is_err());
        assert!(parse_assignment("Speed=").is_err());
        assert!(parse_assignment("Speed").is_err());
    }

    #[test]
    fn toggle_understands_on_off() {
        assert!(parse_toggle("on").unwrap());
        assert!(!parse_toggle("OFF").unwrap());
        assert!(parse_toggle("sometimes").is_err());
    }

    #[test]
    fn check_subcommand_parses_shared_scene_flags() {
        let cli = Cli::try_parse_from([
            "computeshader",
            "check",
            "slime.toml",
            "--frames",
            "5",
            "--seed",
            "7",
            "--set",
            "MoveSpeed=40",
        ])
        .unwrap();
        let Some(Command::Check(args)) = cli.command else {
            panic!("expected check subcommand");
        };
        assert_eq!(args.scene, "slime.toml");
        assert_eq!(args.frames, 5);
        assert_eq!(args.scene_args.seed, 7);
        assert_eq!(
            args.scene_args.overrides,
            vec![("MoveSpeed".to_string(), "40".to_string())]
        );
    }

    #[test]
    fn run_defaults_to_vsync_and_watching() {
        let cli = Cli::try_parse_from(["computeshader", "scenes/gravity.toml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.scene.as_deref(), Some("scenes/gravity.toml"));
        assert!(cli.run.vsync);
        assert!(!cli.run.no_watch);
        assert_eq!(cli.run.scene_args.size, None);
    }
}
