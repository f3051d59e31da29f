//! Renders the engine (xray/v2ray) JSON config for a single bridge: one HTTP
//! inbound on the allocated port, the outbound under test plus `direct` and
//! `block`, and a single routing rule sending all traffic to it.

use serde_json::{Value, json};

pub fn render_engine_config(port: u16, outbound_config: &Value) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "tag": "http-in",
            "listen": "127.0.0.1",
            "port": port,
            "protocol": "http",
            "settings": {},
        }],
        "outbounds": [
            outbound_config,
            { "tag": "direct", "protocol": "freedom", "settings": {} },
            { "tag": "block", "protocol": "blackhole", "settings": {} },
        ],
        "routing": {
            "domainStrategy": "AsIs",
            "rules": [{
                "type": "field",
                "outboundTag": outbound_config["tag"],
                "network": "tcp,udp",
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_bit_exact_shape() {
        let outbound = json!({"tag": "t1", "protocol": "vless", "settings": {}});
        let config = render_engine_config(1080, &outbound);

        assert_eq!(config["inbounds"][0]["port"], 1080);
        assert_eq!(config["inbounds"][0]["protocol"], "http");
        assert_eq!(config["outbounds"].as_array().unwrap().len(), 3);
        assert_eq!(config["outbounds"][1]["tag"], "direct");
        assert_eq!(config["outbounds"][1]["protocol"], "freedom");
        assert_eq!(config["outbounds"][2]["tag"], "block");
        assert_eq!(config["outbounds"][2]["protocol"], "blackhole");
        assert_eq!(config["routing"]["rules"][0]["outboundTag"], "t1");
        assert_eq!(config["routing"]["rules"][0]["network"], "tcp,udp");
    }
}
