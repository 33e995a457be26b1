// blpmux/src/names.rs
// Element and message names used by the provider schema.

// --- Services ---
pub const REFDATA_SERVICE: &str = "//blp/refdata";
pub const MKTDATA_SERVICE: &str = "//blp/mktdata";
pub const INSTRUMENTS_SERVICE: &str = "//blp/instruments";
pub const APIFLDS_SERVICE: &str = "//blp/apiflds";

// --- Session / service status messages ---
pub const SESSION_STARTED: &str = "SessionStarted";
pub const SESSION_TERMINATED: &str = "SessionTerminated";
pub const SESSION_STARTUP_FAILURE: &str = "SessionStartupFailure";
pub const SESSION_CONNECTION_UP: &str = "SessionConnectionUp";
pub const SESSION_CONNECTION_DOWN: &str = "SessionConnectionDown";
pub const SESSION_CLUSTER_INFO: &str = "SessionClusterInfo";
pub const SESSION_CLUSTER_UPDATE: &str = "SessionClusterUpdate";
pub const SERVICE_OPENED: &str = "ServiceOpened";
pub const SERVICE_OPEN_FAILURE: &str = "ServiceOpenFailure";
pub const SERVICE_NAME: &str = "serviceName";

// --- Subscription status messages ---
pub const SUBSCRIPTION_STARTED: &str = "SubscriptionStarted";
pub const SUBSCRIPTION_STREAMS_ACTIVATED: &str = "SubscriptionStreamsActivated";
pub const MARKET_DATA_EVENTS: &str = "MarketDataEvents";

// --- Admin messages ---
pub const SLOW_CONSUMER_WARNING: &str = "SlowConsumerWarning";
pub const SLOW_CONSUMER_WARNING_CLEARED: &str = "SlowConsumerWarningCleared";
pub const DATA_LOSS: &str = "DataLoss";
pub const REQUEST_TEMPLATE_AVAILABLE: &str = "RequestTemplateAvailable";
pub const REQUEST_TEMPLATE_PENDING: &str = "RequestTemplatePending";
pub const REQUEST_TEMPLATE_TERMINATED: &str = "RequestTemplateTerminated";

// --- Response payload ---
pub const REFERENCE_DATA_RESPONSE: &str = "ReferenceDataResponse";
pub const HISTORICAL_DATA_RESPONSE: &str = "HistoricalDataResponse";
pub const RESPONSE_ERROR: &str = "responseError";
pub const SECURITY_DATA: &str = "securityData";
pub const SECURITY: &str = "security";
pub const SECURITY_ERROR: &str = "securityError";
pub const FIELD_DATA: &str = "fieldData";
pub const FIELD_EXCEPTIONS: &str = "fieldExceptions";
pub const FIELD_ID: &str = "fieldId";
pub const ERROR_INFO: &str = "errorInfo";
pub const MESSAGE: &str = "message";
pub const DATE: &str = "date";

// --- Field search / instrument lookup ---
pub const CATEGORY: &str = "category";
pub const FIELD_INFO: &str = "fieldInfo";
pub const ID: &str = "id";
pub const RESULTS: &str = "results";

// --- Request options ---
pub const SECURITIES: &str = "securities";
pub const FIELDS: &str = "fields";
pub const START_DATE: &str = "startDate";
pub const END_DATE: &str = "endDate";
pub const QUERY: &str = "query";
pub const MAX_RESULTS: &str = "maxResults";
pub const SEARCH_SPEC: &str = "searchSpec";
