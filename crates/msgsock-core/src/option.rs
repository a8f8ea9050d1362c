//! 不可变的布尔选项与握手角色。
//!
//! 每个选项都是独立的新类型，避免在函数签名里出现一串无法区分含义的 `bool`。

macro_rules! flag {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(pub bool);

        impl $name {
            pub const fn enabled() -> Self {
                Self(true)
            }

            pub const fn disabled() -> Self {
                Self(false)
            }

            pub const fn is_enabled(self) -> bool {
                self.0
            }
        }

        impl From<bool> for $name {
            fn from(value: bool) -> Self {
                Self(value)
            }
        }
    };
}

flag!(
    /// 连接是否启用 TLS。
    SslEnabled
);
flag!(
    /// 解析结果是否允许使用 IPv6 地址。
    Ipv6Enabled
);
flag!(
    /// 监听套接字是否设置 `SO_REUSEADDR`。
    ReuseAddressEnabled
);

/// TLS 协商时本端扮演的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeSide {
    Client,
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_disabled() {
        assert!(!SslEnabled::default().is_enabled());
        assert!(!Ipv6Enabled::default().is_enabled());
        assert!(ReuseAddressEnabled::from(true).is_enabled());
    }
}
