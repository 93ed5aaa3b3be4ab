pub fn run(config_path: Option<&str>) {
    let config = super::load_config(config_path);
    match config.to_json() {
        Ok(json) => println!("{json}"),
        Err(e) => super::fail(e),
    }
    if let Some(path) = config_path {
        eprintln!("✓ {path} is valid");
    }
}
