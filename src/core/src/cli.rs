use clap::Parser;

#[derive(Parser)]
#[command(
    about = "scopeject - ptrace-based dlopen injector",
    version
)]
pub struct Cli {
    /// pid of the running process to inject into
    pub pid: i32,

    /// absolute path to the shared object to load in the target process
    pub agent_path: String,

    #[clap(long, help = "increase log verbosity (can be repeated)", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
