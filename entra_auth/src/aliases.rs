//! Short-name lookups for resources, client ids and user agents. Unknown
//! names pass through unchanged so callers can always supply literal values.

pub fn resolve_resource(name: &str) -> String {
    match name.to_lowercase().as_str() {
        "aadgraph" => "https://graph.windows.net/",
        "msgraph" => "https://graph.microsoft.com/",
        "azrm" | "azurerm" => "https://management.core.windows.net/",
        "outlook" => "https://outlook.office365.com/",
        "keyvault" => "https://vault.azure.net/",
        "storage" => "https://storage.azure.com/",
        "devicereg" | "drs" => "urn:ms-drs:enterpriseregistration.windows.net",
        _ => return name.to_string(),
    }
    .to_string()
}

pub fn resolve_client(name: &str) -> String {
    match name.to_lowercase().as_str() {
        "aadps" | "azuread" => "1b730954-1685-4b74-9bfd-dac224a7b894",
        "azps" | "azurepowershell" => "1950a258-227b-4e31-a9cf-717495945fc2",
        "azcli" => "04b07795-8ddb-461a-bbee-02f9e1bf7b46",
        "teams" | "msteams" => "1fec8e78-bce4-4aaf-ab1b-5451cc387264",
        "msedge" | "edge" => "ecd6b820-32c2-49b6-98a6-444530e5a77a",
        "office" => "d3590ed6-52b3-4102-aeff-aad2292ab01c",
        "broker" => "29d9ed98-a469-4536-ade2-f981bc1d605e",
        "companyportal" | "intune" => "9ba1a5c7-f17a-4de9-a1f1-6178c8d51223",
        _ => return name.to_string(),
    }
    .to_string()
}

pub fn resolve_user_agent(name: &str) -> String {
    match name.to_lowercase().as_str() {
        "chrome" => {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/119.0.0.0 Safari/537.36"
        }
        "edge" => {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/119.0.0.0 Safari/537.36 Edg/119.0.2151.44"
        }
        "firefox" => "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/119.0",
        "android" => {
            "Mozilla/5.0 (Linux; Android 13) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/119.0.0.0 Mobile Safari/537.36"
        }
        "ios" => {
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1"
        }
        "dsreg" => crate::constants::DSREG_USER_AGENT,
        _ => return name.to_string(),
    }
    .to_string()
}
