use std::fs;
use std::path::Path;

/// `#define NAME "value"` entries read from ota_config.h
const CONFIG_KEYS: [&str; 3] = ["WIFI_SSID", "WIFI_PASSWORD", "OTA_URL"];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    println!("cargo:rerun-if-changed=ota_config.h");

    // Read WiFi and update server configuration if it exists
    let config_path = "ota_config.h";
    if Path::new(config_path).exists() {
        let contents = fs::read_to_string(config_path)?;

        for key in CONFIG_KEYS {
            let define = format!("#define {}", key);
            let value = contents
                .lines()
                .find(|l| l.trim_start().starts_with(&define))
                .and_then(|l| l.split('"').nth(1))
                .unwrap_or("");
            println!("cargo:rustc-env={}={}", key, value);
        }
    } else {
        // Use empty defaults if no config file
        for key in CONFIG_KEYS {
            println!("cargo:rustc-env={}=", key);
        }
        println!("cargo:warning=ota_config.h not found! Copy ota_config.h.example to ota_config.h and add your credentials.");
    }

    Ok(())
}
