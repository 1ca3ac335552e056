// Static blacklist of common VPN clients. Unioned into the active
// blocklists when `block_common_vpn` is set; kept deliberately small and
// name-based, same tradeoffs as the rest of user-mode blocking.

/// Process names of common VPN clients.
pub const VPN_EXECUTABLES: &[&str] = &[
    "NordVPN.exe",
    "ExpressVPN.exe",
    "openvpn.exe",
    "wireguard.exe",
    "pia-client.exe",
    "Surfshark.exe",
    "CyberGhost.exe",
    "ProtonVPN.exe",
    "Windscribe.exe",
    "Mullvad VPN.exe",
    "HotspotShield.exe",
    "TunnelBear.exe",
    "avgvpn.exe",
    "vpndaemon.exe",
];

/// Landing domains of common VPN vendors.
pub const VPN_DOMAINS: &[&str] = &[
    "nordvpn.com",
    "expressvpn.com",
    "openvpn.net",
    "wireguard.com",
    "privateinternetaccess.com",
    "surfshark.com",
    "cyberghostvpn.com",
    "protonvpn.com",
    "windscribe.com",
    "mullvad.net",
    "hotspotshield.com",
    "tunnelbear.com",
];

pub fn vpn_executables() -> impl Iterator<Item = String> {
    VPN_EXECUTABLES.iter().map(|s| s.to_string())
}

pub fn vpn_domains() -> impl Iterator<Item = String> {
    VPN_DOMAINS.iter().map(|s| s.to_string())
}
