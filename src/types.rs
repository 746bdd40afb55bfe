// =============================================================================
// Shared types used across the TraderTerminal routing engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trading action carried by an inbound alert.
///
/// `Close` and `Exit` are synonyms on the wire (TradingView strategies emit
/// both); the router treats them identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    Buy,
    Sell,
    Close,
    Exit,
}

impl AlertAction {
    /// +1.0 for buys, -1.0 for sells. Close/exit resolve against the open
    /// position and have no intrinsic sign.
    pub fn side_sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Close | Self::Exit => 0.0,
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Close | Self::Exit)
    }
}

impl std::fmt::Display for AlertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Close => write!(f, "close"),
            Self::Exit => write!(f, "exit"),
        }
    }
}

/// Resolved execution side of an order. Closing alerts resolve to the side
/// opposite the open position before an order is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type accepted from alerts and manual order entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Market
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
            Self::Stop => write!(f, "stop"),
            Self::StopLimit => write!(f, "stop_limit"),
        }
    }
}

/// Life-cycle status of an order.
///
/// Terminal states: Filled, Cancelled, Rejected, Expired. No fill may be
/// applied to an order in a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Working,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Working => write!(f, "working"),
            Self::Partial => write!(f, "partial"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Operating mode of a strategy, governing whether its orders reach live
/// venues. Transitions are owned by the performance tracker; promotion to
/// Live additionally requires an explicit operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Live,
    Paper,
    Suspended,
}

impl Default for StrategyMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Paper => write!(f, "paper"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Status of a funded account under rule enforcement.
///
/// `Active -> Violated` on any rule violation; `Violated -> Paused` only via
/// human acknowledgement; `Paused -> Active` via resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Violated,
    Paused,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Violated => write!(f, "violated"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Market session bucket used by the paper simulator's liquidity model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingSession {
    Regular,
    Extended,
    Closed,
}

impl std::fmt::Display for TradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regular => write!(f, "regular"),
            Self::Extended => write!(f, "extended"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Asset class, selecting the commission/fee schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Futures,
    Equity,
}

impl Default for AssetClass {
    fn default() -> Self {
        Self::Futures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_format_is_lowercase() {
        assert_eq!(serde_json::to_string(&AlertAction::Buy).unwrap(), "\"buy\"");
        let a: AlertAction = serde_json::from_str("\"exit\"").unwrap();
        assert_eq!(a, AlertAction::Exit);
        assert!(a.is_closing());
    }

    #[test]
    fn order_type_snake_case() {
        assert_eq!(
            serde_json::to_string(&OrderType::StopLimit).unwrap(),
            "\"stop_limit\""
        );
        let t: OrderType = serde_json::from_str("\"stop_limit\"").unwrap();
        assert_eq!(t, OrderType::StopLimit);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Working.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn side_signs() {
        assert_eq!(AlertAction::Buy.side_sign(), 1.0);
        assert_eq!(AlertAction::Sell.side_sign(), -1.0);
        assert_eq!(AlertAction::Close.side_sign(), 0.0);
    }
}
