use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub port: u16,

    #[envconfig(from = "QTASK_TOPIC", default = "tasks")]
    pub topic: String,

    #[envconfig(from = "QTASK_GROUP", default = "workers")]
    pub group: String,

    #[envconfig(nested = true)]
    pub qtask: qtask::config::Config,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
