//! Client configuration rendering: the wg-quick style text a device imports,
//! and the same text as a QR code PNG.

use std::fmt::{self, Write as _};
use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, Luma};
use qrcode::QrCode;

use crate::error::{Error, Result};
use crate::store::{GatewayRecord, PeerRecord};

const QR_MIN_DIMENSION: u32 = 320;

/// Render a complete client config for `peer` on `gateway`. AmneziaWG
/// gateways get their obfuscation parameters in the `[Interface]` section.
pub fn client_config(private_key: &str, peer: &PeerRecord, gateway: &GatewayRecord) -> Result<String> {
    let server_key = gateway
        .public_key
        .as_deref()
        .ok_or_else(|| Error::Internal(format!("gateway {} has no public key", gateway.id)))?;
    let endpoint = gateway
        .endpoint()
        .ok_or_else(|| Error::Internal(format!("gateway {} has no endpoint", gateway.id)))?;

    let mut out = String::new();
    write_config(&mut out, private_key, server_key, &endpoint, peer, gateway)
        .map_err(|e| Error::Internal(format!("render config: {e}")))?;
    Ok(out)
}

fn write_config(
    out: &mut String,
    private_key: &str,
    server_key: &str,
    endpoint: &str,
    peer: &PeerRecord,
    gateway: &GatewayRecord,
) -> fmt::Result {
    writeln!(out, "[Interface]")?;
    writeln!(out, "PrivateKey = {private_key}")?;
    writeln!(out, "Address = {}/32", peer.address)?;
    if !peer.dns_servers.is_empty() {
        writeln!(out, "DNS = {}", peer.dns_servers.join(", "))?;
    }
    writeln!(out, "MTU = {}", peer.mtu)?;
    if let Some(o) = gateway.effective_obfuscation() {
        writeln!(out, "Jc = {}", o.jc)?;
        writeln!(out, "Jmin = {}", o.jmin)?;
        writeln!(out, "Jmax = {}", o.jmax)?;
        writeln!(out, "S1 = {}", o.s1)?;
        writeln!(out, "S2 = {}", o.s2)?;
        writeln!(out, "H1 = {}", o.h1)?;
        writeln!(out, "H2 = {}", o.h2)?;
        writeln!(out, "H3 = {}", o.h3)?;
        writeln!(out, "H4 = {}", o.h4)?;
    }
    writeln!(out)?;
    writeln!(out, "[Peer]")?;
    writeln!(out, "PublicKey = {server_key}")?;
    writeln!(out, "Endpoint = {endpoint}")?;
    writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "))?;
    if peer.persistent_keepalive > 0 {
        writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive)?;
    }
    Ok(())
}

/// Encode `text` as a QR code and return the PNG, base64 encoded.
pub fn qr_png_base64(text: &str) -> Result<String> {
    let code = QrCode::new(text.as_bytes())
        .map_err(|e| Error::Internal(format!("qr encode: {e}")))?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
        .build();

    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)
        .map_err(|e| Error::Internal(format!("png encode: {e}")))?;
    Ok(STANDARD.encode(png.into_inner()))
}
