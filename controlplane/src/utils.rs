// Returns true if the provided error is a not found error.
pub fn check_if_not_found_err(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

// Returns true if the API server rejected a write because of a resourceVersion
// mismatch or an existing object of the same name.
pub fn check_if_conflict_err(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}
