//! Renderer invocation strategies, tried in table order.

/// Placeholder replaced with the source file name (relative to the mount).
const SRC: &str = "{src}";
/// Placeholder replaced with `<output_name>.mp4`.
const OUT_FILE: &str = "{out_file}";
/// Placeholder replaced with the bare output name.
const OUT_STEM: &str = "{out_stem}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub name: &'static str,
    pub args: &'static [&'static str],
}

pub const STRATEGIES: &[Strategy] = &[
    Strategy {
        name: "render-subcommand",
        args: &[
            "python", "-m", "manim", "render", SRC, "-o", OUT_FILE, "-qm", "--verbosity", "DEBUG",
        ],
    },
    Strategy {
        name: "legacy",
        args: &["python", "-m", "manim", SRC, "-o", OUT_FILE, "-qm"],
    },
    Strategy {
        name: "minimal",
        args: &["python", "-m", "manim", SRC, "--output_file", OUT_STEM, "-qh"],
    },
];

impl Strategy {
    pub fn command(&self, source_name: &str, output_name: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match *arg {
                SRC => source_name.to_string(),
                OUT_FILE => format!("{output_name}.mp4"),
                OUT_STEM => output_name.to_string(),
                other => other.to_string(),
            })
            .collect()
    }
}
