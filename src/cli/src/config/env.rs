#[derive(Debug, Clone, Default)]
pub struct Values {
  pub config: Option<String>,
  pub log_level: Option<String>,
}

pub fn parse() -> Values {
  let _ = dotenv::dotenv();

  Values {
    config: std::env::var("REGMAP_CONFIG").ok(),
    log_level: std::env::var("REGMAP_LOG_LEVEL").ok(),
  }
}
