use botarena::client::Harness;
use botarena::configuration::Configuration;

fn main() -> anyhow::Result<()> {
    let config = Configuration::from_env().with_log(true);
    Harness::new(config).run()
}
