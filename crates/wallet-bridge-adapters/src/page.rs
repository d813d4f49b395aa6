use wallet_bridge_core::{CallerInfo, PageContextPort};

/// Caller metadata fixed at construction, for hosts without a document.
#[derive(Debug, Clone, Default)]
pub struct StaticPageContext {
    info: CallerInfo,
}

impl StaticPageContext {
    pub fn new(origin: &str, title: Option<&str>, icon_href: Option<&str>) -> Self {
        Self {
            info: CallerInfo::from_page(origin, title, icon_href),
        }
    }
}

impl PageContextPort for StaticPageContext {
    fn caller_info(&self) -> CallerInfo {
        self.info.clone()
    }
}
