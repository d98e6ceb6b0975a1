use anyhow::Result;

fn main() -> Result<()> {
    sandboxd::cli::run()
}
